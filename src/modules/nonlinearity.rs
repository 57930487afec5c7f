//! Output nonlinearity.

use crate::data::{DataContainer, gather};
use crate::domain::Field;
use crate::error::FitError;
use crate::math::stats;
use crate::stack::StackState;

use super::{Param, Stage, expect_len, is_estimation, transform};

/// Double exponential (Gompertz) sigmoid: `y = b − a·exp(−exp(k·(x − s)))`.
///
/// `theta = [b, a, k, s]`: upper asymptote, range, slope, shift.
#[derive(Debug, Clone)]
pub struct DoubleExponential {
    pub input: Field,
    pub output: Field,
    pub theta: [f64; 4],
}

impl Default for DoubleExponential {
    fn default() -> Self {
        Self {
            input: Field::Pred,
            output: Field::Pred,
            theta: [1.0, 1.0, 1.0, 0.0],
        }
    }
}

fn dexp(theta: &[f64; 4], x: f64) -> f64 {
    let [base, amplitude, kappa, shift] = *theta;
    base - amplitude * (-(kappa * (x - shift)).exp()).exp()
}

impl Stage for DoubleExponential {
    fn name(&self) -> &'static str {
        "nonlinearity.dexp"
    }

    /// Span the observed response range, centered on the current prediction.
    fn initialize(&mut self, input: &[DataContainer], _state: &mut StackState) -> Result<(), FitError> {
        let resp = gather(input, Field::Resp, is_estimation)?;
        let pred = gather(input, self.input, is_estimation)?;
        let resp: Vec<f64> = resp.into_iter().filter(|v| v.is_finite()).collect();
        let pred: Vec<f64> = pred.into_iter().filter(|v| v.is_finite()).collect();
        let (Some(lo), Some(hi)) = (
            resp.iter().copied().reduce(f64::min),
            resp.iter().copied().reduce(f64::max),
        ) else {
            return Ok(());
        };
        let shift = stats::mean(&pred).unwrap_or(0.0);
        let kappa = match stats::std_dev(&pred) {
            Some(s) if s > 0.0 => 1.0 / s,
            _ => 1.0,
        };
        self.theta = [hi, hi - lo, kappa, shift];
        Ok(())
    }

    fn evaluate(
        &mut self,
        input: &[DataContainer],
        _state: &mut StackState,
    ) -> Result<Vec<DataContainer>, FitError> {
        let theta = self.theta;
        transform(input, self.output, |c| Ok(c.require(self.input)?.mapv(|x| dexp(&theta, x))))
    }

    fn fit_fields(&self) -> &[Param] {
        &[Param::Theta]
    }

    fn param(&self, param: Param) -> Option<Vec<f64>> {
        (param == Param::Theta).then(|| self.theta.to_vec())
    }

    fn set_param(&mut self, param: Param, values: &[f64]) -> Result<(), FitError> {
        if param != Param::Theta {
            return Err(FitError::Configuration(format!("{} has no `{}` parameter", self.name(), param.as_str())));
        }
        expect_len(self.name(), param, values, 4)?;
        self.theta = [values[0], values[1], values[2], values[3]];
        Ok(())
    }
}
