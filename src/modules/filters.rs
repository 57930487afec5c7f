//! Linear spectro-temporal filters.

use ndarray::{Array2, Array3, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use crate::data::{DataContainer, gather};
use crate::domain::Field;
use crate::error::FitError;
use crate::math::stats;
use crate::stack::StackState;

use super::{Param, Stage, expect_len, is_estimation, transform};

/// Mixes `C` input channels down to `K` output channels: `y[k] = Σ_c w[k,c]·x[c]`.
#[derive(Debug, Clone)]
pub struct WeightChannels {
    pub input: Field,
    pub output: Field,
    pub num_chans: usize,
    /// `(num_chans, input channels)`; sized on initialization.
    pub coefs: Array2<f64>,
}

impl WeightChannels {
    pub fn new(num_chans: usize) -> Self {
        Self {
            input: Field::Stim,
            output: Field::Pred,
            num_chans,
            coefs: Array2::zeros((num_chans, 0)),
        }
    }
}

impl Stage for WeightChannels {
    fn name(&self) -> &'static str {
        "filters.weight_channels"
    }

    fn initialize(&mut self, input: &[DataContainer], state: &mut StackState) -> Result<(), FitError> {
        let Some(first) = input.first() else {
            return Ok(());
        };
        let channels = first.require(self.input)?.len_of(Axis(0));
        if self.coefs.dim() == (self.num_chans, channels) {
            return Ok(());
        }
        let mut rng = StdRng::seed_from_u64(state.seed);
        let noise = Normal::new(1.0, 0.1)
            .map_err(|e| FitError::Configuration(format!("weight initialisation: {e}")))?;
        self.coefs = Array2::from_shape_fn((self.num_chans, channels), |_| {
            noise.sample(&mut rng) / channels as f64
        });
        Ok(())
    }

    fn evaluate(
        &mut self,
        input: &[DataContainer],
        _state: &mut StackState,
    ) -> Result<Vec<DataContainer>, FitError> {
        transform(input, self.output, |d| {
            let x = d.require(self.input)?;
            let (channels, trials, time) = x.dim();
            if channels != self.coefs.ncols() {
                return Err(FitError::Shape(format!(
                    "{} has {} input weights per channel but `{}` has {channels} channels",
                    self.name(),
                    self.coefs.ncols(),
                    self.input
                )));
            }
            let flat = x
                .to_shape((channels, trials * time))
                .map_err(|e| FitError::Shape(e.to_string()))?;
            let mixed = self.coefs.dot(&flat);
            mixed
                .into_shape_with_order((self.num_chans, trials, time))
                .map_err(|e| FitError::Shape(e.to_string()))
        })
    }

    fn fit_fields(&self) -> &[Param] {
        &[Param::Coefs]
    }

    fn param(&self, param: Param) -> Option<Vec<f64>> {
        match param {
            Param::Coefs => Some(self.coefs.iter().copied().collect()),
            _ => None,
        }
    }

    fn set_param(&mut self, param: Param, values: &[f64]) -> Result<(), FitError> {
        match param {
            Param::Coefs => {
                expect_len(self.name(), param, values, self.coefs.len())?;
                self.coefs = Array2::from_shape_vec(self.coefs.dim(), values.to_vec())
                    .map_err(|e| FitError::Shape(e.to_string()))?;
                Ok(())
            }
            other => Err(FitError::Configuration(format!(
                "{} has no `{}` parameter",
                self.name(),
                other.as_str()
            ))),
        }
    }
}

/// Causal FIR filter per channel, summed into one output channel plus a
/// baseline: `y[t] = b + Σ_c Σ_k h[c,k]·x[c,t-k]`.
#[derive(Debug, Clone)]
pub struct Fir {
    pub input: Field,
    pub output: Field,
    pub num_coefs: usize,
    /// `(input channels, num_coefs)`; sized on initialization.
    pub coefs: Array2<f64>,
    pub baseline: f64,
}

impl Fir {
    pub fn new(num_coefs: usize) -> Self {
        Self {
            input: Field::Pred,
            output: Field::Pred,
            num_coefs,
            coefs: Array2::zeros((0, num_coefs)),
            baseline: 0.0,
        }
    }
}

impl Stage for Fir {
    fn name(&self) -> &'static str {
        "filters.fir"
    }

    fn initialize(&mut self, input: &[DataContainer], _state: &mut StackState) -> Result<(), FitError> {
        let Some(first) = input.first() else {
            return Ok(());
        };
        let channels = first.require(self.input)?.len_of(Axis(0));
        if self.coefs.dim() != (channels, self.num_coefs) {
            self.coefs = Array2::zeros((channels, self.num_coefs));
        }
        let resp = gather(input, Field::Resp, is_estimation)?;
        let (finite, _) = stats::finite_pairs(&resp, &resp);
        self.baseline = stats::mean(&finite).unwrap_or(0.0);
        Ok(())
    }

    fn evaluate(
        &mut self,
        input: &[DataContainer],
        _state: &mut StackState,
    ) -> Result<Vec<DataContainer>, FitError> {
        transform(input, self.output, |d| {
            let x = d.require(self.input)?;
            let (channels, trials, time) = x.dim();
            if channels != self.coefs.nrows() {
                return Err(FitError::Shape(format!(
                    "{} is sized for {} channels but `{}` has {channels}",
                    self.name(),
                    self.coefs.nrows(),
                    self.input
                )));
            }
            let mut y = Array3::from_elem((1, trials, time), self.baseline);
            for c in 0..channels {
                for (k, &h) in self.coefs.row(c).iter().enumerate() {
                    if h == 0.0 {
                        continue;
                    }
                    for r in 0..trials {
                        for t in k..time {
                            y[[0, r, t]] += h * x[[c, r, t - k]];
                        }
                    }
                }
            }
            Ok(y)
        })
    }

    fn fit_fields(&self) -> &[Param] {
        &[Param::Coefs, Param::Baseline]
    }

    fn param(&self, param: Param) -> Option<Vec<f64>> {
        match param {
            Param::Coefs => Some(self.coefs.iter().copied().collect()),
            Param::Baseline => Some(vec![self.baseline]),
            Param::Theta => None,
        }
    }

    fn set_param(&mut self, param: Param, values: &[f64]) -> Result<(), FitError> {
        match param {
            Param::Coefs => {
                expect_len(self.name(), param, values, self.coefs.len())?;
                self.coefs = Array2::from_shape_vec(self.coefs.dim(), values.to_vec())
                    .map_err(|e| FitError::Shape(e.to_string()))?;
            }
            Param::Baseline => {
                expect_len(self.name(), param, values, 1)?;
                self.baseline = values[0];
            }
            Param::Theta => {
                return Err(FitError::Configuration(format!("{} has no `theta` parameter", self.name())));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::container::tests::averaged;
    use ndarray::array;

    #[test]
    fn weight_channels_mixes_stimulus_channels() {
        let d = averaged(vec![1, 2], 3, false);
        let mut wc = WeightChannels::new(1);
        let mut state = StackState::default();
        wc.initialize(std::slice::from_ref(&d), &mut state).unwrap();
        assert_eq!(wc.coefs.dim(), (1, 2));
        wc.coefs = array![[1.0, 0.5]];
        let out = wc.evaluate(std::slice::from_ref(&d), &mut state).unwrap();
        let pred = out[0].pred.as_ref().unwrap();
        assert_eq!(pred.dim(), (1, 2, 3));
        // stim[c,r,t] = c*100 + r*10 + t
        assert_eq!(pred[[0, 1, 2]], 12.0 + 0.5 * 112.0);
    }

    #[test]
    fn weight_channels_initialization_is_seeded() {
        let d = averaged(vec![1, 2], 3, false);
        let mut a = WeightChannels::new(2);
        let mut b = WeightChannels::new(2);
        let mut state = StackState::default();
        a.initialize(std::slice::from_ref(&d), &mut state).unwrap();
        b.initialize(std::slice::from_ref(&d), &mut state).unwrap();
        assert_eq!(a.coefs, b.coefs);
    }

    #[test]
    fn fir_is_causal_and_adds_baseline() {
        let mut d = averaged(vec![1], 4, false);
        d.pred = Some(Array3::from_shape_vec((1, 1, 4), vec![1.0, 0.0, 0.0, 0.0]).unwrap());
        let mut fir = Fir::new(3);
        let mut state = StackState::default();
        fir.initialize(std::slice::from_ref(&d), &mut state).unwrap();
        fir.set_param(Param::Coefs, &[0.5, 0.25, 0.125]).unwrap();
        fir.set_param(Param::Baseline, &[1.0]).unwrap();
        let out = fir.evaluate(&[d], &mut state).unwrap();
        let y: Vec<f64> = out[0].pred.as_ref().unwrap().iter().copied().collect();
        assert_eq!(y, vec![1.5, 1.25, 1.125, 1.0]);
    }

    #[test]
    fn fir_baseline_starts_at_mean_response() {
        let mut d = averaged(vec![1, 1, 1], 2, false);
        d.pred = Some(Array3::zeros((1, 3, 2)));
        let mut fir = Fir::new(2);
        fir.initialize(&[d], &mut StackState::default()).unwrap();
        assert!((fir.baseline - 1.0).abs() < 1e-12);
        assert_eq!(fir.coefs.dim(), (1, 2));
    }

    #[test]
    fn wrong_parameter_length_is_rejected() {
        let mut fir = Fir::new(2);
        fir.coefs = Array2::zeros((1, 2));
        let err = fir.set_param(Param::Coefs, &[1.0]).unwrap_err();
        assert!(matches!(err, FitError::Shape(_)));
    }
}
