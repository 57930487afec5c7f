//! Static gain stages, including the pupil-dependent gain family.
//!
//! Every gain maps a prediction `x` (and, for pupil gains, the pupil trace `p`)
//! elementwise through a parametric curve with parameters `theta`.

use ndarray::{Array3, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::data::DataContainer;
use crate::domain::Field;
use crate::error::FitError;
use crate::math::ols;
use crate::stack::StackState;

use super::{Param, Stage, expect_len, is_estimation, transform};

/// `y = d + g·x`.
#[derive(Debug, Clone)]
pub struct DcGain {
    pub input: Field,
    pub output: Field,
    pub theta: [f64; 2],
}

impl Default for DcGain {
    fn default() -> Self {
        Self {
            input: Field::Pred,
            output: Field::Pred,
            theta: [0.0, 1.0],
        }
    }
}

impl Stage for DcGain {
    fn name(&self) -> &'static str {
        "gain.dc"
    }

    fn evaluate(
        &mut self,
        input: &[DataContainer],
        _state: &mut StackState,
    ) -> Result<Vec<DataContainer>, FitError> {
        let [d, g] = self.theta;
        transform(input, self.output, |c| Ok(c.require(self.input)?.mapv(|x| d + g * x)))
    }

    fn fit_fields(&self) -> &[Param] {
        &[Param::Theta]
    }

    fn param(&self, param: Param) -> Option<Vec<f64>> {
        (param == Param::Theta).then(|| self.theta.to_vec())
    }

    fn set_param(&mut self, param: Param, values: &[f64]) -> Result<(), FitError> {
        if param != Param::Theta {
            return Err(FitError::Configuration(format!(
                "{} has no `{}` parameter",
                self.name(),
                param.as_str()
            )));
        }
        expect_len(self.name(), param, values, 2)?;
        self.theta = [values[0], values[1]];
        Ok(())
    }
}

/// Shape of a pupil gain curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainKind {
    /// `t0 + t1·x`; same parameter count as `Linear` minus the pupil terms.
    NoPupil,
    /// `t0 + t1·x + t2·p + t3·x·p`.
    Linear,
    /// `Linear` with pupil rows shuffled across trials.
    LinearControl,
    /// `t0 + t1·x + Σ_k t_{k+1}·x·p^k` for `k = 1..=degree`.
    Polynomial { degree: u32 },
    /// `t0 + t1·x·exp(t2·p − t3)`.
    Exponential,
    /// `t0 + t1·x + t2·p^o + t3·x·p^o`.
    Power { order: u32 },
    /// `t2 + t0·x / sqrt(1 + (t1/p)^(2·order))`.
    ButterworthHighPass { order: u32 },
}

impl GainKind {
    pub fn name(self) -> &'static str {
        match self {
            GainKind::NoPupil => "pupil.nopupgain",
            GainKind::Linear => "pupil.pupgain",
            GainKind::LinearControl => "pupil.pupgainctl",
            GainKind::Polynomial { .. } => "pupil.polypupgain",
            GainKind::Exponential => "pupil.exppupgain",
            GainKind::Power { .. } => "pupil.powergain",
            GainKind::ButterworthHighPass { .. } => "pupil.butterworth",
        }
    }

    pub fn initial_theta(self) -> Vec<f64> {
        match self {
            GainKind::NoPupil => vec![0.0, 1.0],
            GainKind::Linear | GainKind::LinearControl | GainKind::Power { .. } => vec![0.0, 1.0, 0.0, 0.0],
            GainKind::Polynomial { degree } => {
                let mut theta = vec![0.0; degree as usize + 2];
                theta[1] = 1.0;
                theta
            }
            GainKind::Exponential => vec![0.0, 1.0, 0.0, 0.0],
            GainKind::ButterworthHighPass { .. } => vec![1.0, 25.0, 0.0],
        }
    }

    pub fn uses_pupil(self) -> bool {
        self != GainKind::NoPupil
    }

    fn apply(self, theta: &[f64], x: f64, p: f64) -> f64 {
        match self {
            GainKind::NoPupil => theta[0] + theta[1] * x,
            GainKind::Linear | GainKind::LinearControl => {
                theta[0] + theta[1] * x + theta[2] * p + theta[3] * x * p
            }
            GainKind::Polynomial { .. } => {
                let mut y = theta[0] + theta[1] * x;
                let mut pk = 1.0;
                for t in &theta[2..] {
                    pk *= p;
                    y += t * x * pk;
                }
                y
            }
            GainKind::Exponential => theta[0] + theta[1] * x * (theta[2] * p - theta[3]).exp(),
            GainKind::Power { order } => {
                let po = p.powi(order as i32);
                theta[0] + theta[1] * x + theta[2] * po + theta[3] * x * po
            }
            GainKind::ButterworthHighPass { order } => {
                theta[2] + theta[0] * x / (1.0 + (theta[1] / p).powi(2 * order as i32)).sqrt()
            }
        }
    }

    /// Regressors of a curve that is linear in `theta`, `None` otherwise.
    fn regressors(self, x: f64, p: f64) -> Option<Vec<f64>> {
        match self {
            GainKind::NoPupil => Some(vec![1.0, x]),
            GainKind::Linear | GainKind::LinearControl => Some(vec![1.0, x, p, x * p]),
            GainKind::Polynomial { degree } => {
                let mut row = vec![1.0, x];
                let mut pk = 1.0;
                for _ in 0..degree {
                    pk *= p;
                    row.push(x * pk);
                }
                Some(row)
            }
            GainKind::Power { order } => {
                let po = p.powi(order as i32);
                Some(vec![1.0, x, po, x * po])
            }
            GainKind::Exponential | GainKind::ButterworthHighPass { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PupilGain {
    pub input: Field,
    pub output: Field,
    pub kind: GainKind,
    pub theta: Vec<f64>,
    warned_missing_pupil: bool,
}

impl PupilGain {
    pub fn new(kind: GainKind) -> Self {
        Self {
            input: Field::Pred,
            output: Field::Pred,
            kind,
            theta: kind.initial_theta(),
            warned_missing_pupil: false,
        }
    }

    /// Pupil trace matched to `x`, zeros when the recording has none.
    fn pupil_for(&mut self, c: &DataContainer, x: &Array3<f64>, seed: u64) -> Result<Array3<f64>, FitError> {
        let pupil = match c.pupil.as_ref() {
            Some(p) => p.clone(),
            None => {
                if self.kind.uses_pupil() && !self.warned_missing_pupil {
                    log::warn!("{}: no pupil data, using zeros", self.kind.name());
                    self.warned_missing_pupil = true;
                }
                return Ok(Array3::zeros(x.dim()));
            }
        };
        if pupil.dim() != x.dim() {
            return Err(FitError::Shape(format!(
                "{}: pupil shape {:?} differs from `{}` shape {:?}",
                self.kind.name(),
                pupil.shape(),
                self.input,
                x.shape()
            )));
        }
        if self.kind != GainKind::LinearControl {
            return Ok(pupil);
        }
        let mut order: Vec<usize> = (0..pupil.len_of(Axis(1))).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        Ok(pupil.select(Axis(1), &order))
    }
}

impl Stage for PupilGain {
    fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Least-squares warm start for curves that are linear in `theta`.
    fn initialize(&mut self, input: &[DataContainer], state: &mut StackState) -> Result<(), FitError> {
        let mut rows = Vec::new();
        let mut target = Vec::new();
        for c in input.iter().filter(|c| is_estimation(c)) {
            let x = c.require(self.input)?;
            let p = self.pupil_for(c, x, state.seed)?;
            let resp = c.require(Field::Resp)?;
            if resp.dim() != x.dim() {
                continue;
            }
            for ((&xv, &pv), &yv) in x.iter().zip(p.iter()).zip(resp.iter()) {
                if !(xv.is_finite() && pv.is_finite() && yv.is_finite()) {
                    continue;
                }
                let Some(row) = self.kind.regressors(xv, pv) else {
                    return Ok(());
                };
                rows.push(row);
                target.push(yv);
            }
        }
        if rows.len() < self.theta.len() {
            return Ok(());
        }
        match ols::regress(&rows, &target) {
            Some(theta) if theta.len() == self.theta.len() && theta.iter().all(|v| v.is_finite()) => {
                log::debug!("{}: least-squares start {theta:?}", self.name());
                self.theta = theta;
            }
            _ => log::debug!("{}: least-squares start failed, keeping defaults", self.name()),
        }
        Ok(())
    }

    fn evaluate(
        &mut self,
        input: &[DataContainer],
        state: &mut StackState,
    ) -> Result<Vec<DataContainer>, FitError> {
        let seed = state.seed;
        let kind = self.kind;
        let theta = self.theta.clone();
        let field = self.input;
        let mut out = Vec::with_capacity(input.len());
        for c in input {
            let x = c.require(field)?;
            let p = self.pupil_for(c, x, seed)?;
            let mut y = x.clone();
            y.zip_mut_with(&p, |xv, &pv| *xv = kind.apply(&theta, *xv, pv));
            let mut next = c.clone();
            next.set(self.output, y);
            out.push(next);
        }
        Ok(out)
    }

    fn fit_fields(&self) -> &[Param] {
        &[Param::Theta]
    }

    fn param(&self, param: Param) -> Option<Vec<f64>> {
        (param == Param::Theta).then(|| self.theta.clone())
    }

    fn set_param(&mut self, param: Param, values: &[f64]) -> Result<(), FitError> {
        if param != Param::Theta {
            return Err(FitError::Configuration(format!(
                "{} has no `{}` parameter",
                self.name(),
                param.as_str()
            )));
        }
        expect_len(self.name(), param, values, self.theta.len())?;
        self.theta = values.to_vec();
        Ok(())
    }
}
