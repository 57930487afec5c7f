//! Error metrics.
//!
//! Metric modules pass their input list through unchanged. They score the
//! estimation containers (always) and the active fold's validation containers
//! (when present), store the values on the module, and mirror them into the
//! stack's metadata (`mse_est`, `r_val`, ...).
//!
//! Non-finite samples are discarded pairwise before any statistic is computed.

use ndarray::Axis;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::data::{DataContainer, gather};
use crate::domain::Field;
use crate::error::FitError;
use crate::math::stats;
use crate::stack::StackState;

use super::{Stage, is_estimation, is_validation};

/// Number of contiguous bins used by the shrunk MSE estimate.
const SHRINK_BINS: usize = 10;
/// Resamples drawn for the correlation noise floor.
const FLOOR_RESAMPLES: usize = 1000;
const FLOOR_SUBSET: usize = 500;
const FLOOR_QUANTILE: f64 = 0.95;

fn paired(
    input: &[DataContainer],
    pred: Field,
    resp: Field,
    keep: impl Fn(&DataContainer) -> bool + Copy,
) -> Result<(Vec<f64>, Vec<f64>), FitError> {
    let x1 = gather(input, pred, keep)?;
    let x2 = gather(input, resp, keep)?;
    if x1.len() != x2.len() {
        return Err(FitError::Shape(format!(
            "`{pred}` has {} samples but `{resp}` has {}",
            x1.len(),
            x2.len()
        )));
    }
    Ok(stats::finite_pairs(&x1, &x2))
}

/// Squared error normalized by response power (`norm`) or by sample count.
///
/// Returns exactly 1 when the normalizer is zero.
pub fn mean_square_error(x1: &[f64], x2: &[f64], norm: bool) -> f64 {
    let (x1, x2) = stats::finite_pairs(x1, x2);
    let error: f64 = x1.iter().zip(&x2).map(|(a, b)| (a - b) * (a - b)).sum();
    let denom = if norm {
        x2.iter().map(|b| b * b).sum::<f64>()
    } else {
        x2.len() as f64
    };
    if denom > 0.0 {
        error / denom
    } else {
        log::debug!("mse: zero normalizer, returning 1");
        1.0
    }
}

/// Power-normalized MSE over contiguous bins, shrunk toward 1 by its
/// cross-bin spread.
pub fn shrunk_mean_square_error(x1: &[f64], x2: &[f64], ratio: f64) -> f64 {
    let (x1, x2) = stats::finite_pairs(x1, x2);
    let n = x2.len();
    let power = stats::mean(&x2.iter().map(|b| b * b).collect::<Vec<_>>()).unwrap_or(0.0);
    if n == 0 || power <= 0.0 {
        log::debug!("shrunk mse: no response power, returning 1");
        return 1.0;
    }

    let bounds: Vec<usize> = (0..=SHRINK_BINS)
        .map(|i| ((i * (n + 1)) as f64 / SHRINK_BINS as f64).round_ties_even() as usize)
        .map(|b| b.min(n))
        .collect();
    let per_bin: Vec<f64> = bounds
        .windows(2)
        .filter(|w| w[1] > w[0])
        .map(|w| {
            let sq: f64 = (w[0]..w[1]).map(|i| (x1[i] - x2[i]) * (x1[i] - x2[i])).sum();
            sq / (w[1] - w[0]) as f64 / power
        })
        .collect();

    let (Some(m), Some(s)) = (stats::mean(&per_bin), stats::std_dev(&per_bin)) else {
        return 1.0;
    };
    if m < 1.0 { 1.0 - stats::shrinkage(1.0 - m, s, ratio) } else { m }
}

/// Pearson correlation with the degenerate cases mapped to 0.
pub fn correlation(x1: &[f64], x2: &[f64]) -> f64 {
    let (x1, x2) = stats::finite_pairs(x1, x2);
    if x1.iter().sum::<f64>() == 0.0 || x2.iter().sum::<f64>() == 0.0 {
        log::debug!("correlation: all-zero series, returning 0");
        return 0.0;
    }
    stats::pearson(&x1, &x2).unwrap_or_else(|| {
        log::debug!("correlation: undefined, returning 0");
        0.0
    })
}

/// 95th percentile of correlations between independently resampled subsets.
pub fn noise_floor(x1: &[f64], x2: &[f64], seed: u64) -> f64 {
    let (x1, x2) = stats::finite_pairs(x1, x2);
    let n = x1.len();
    if n == 0 {
        return 0.0;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let draws: Vec<f64> = (0..FLOOR_RESAMPLES)
        .filter_map(|_| {
            let a: Vec<f64> = (0..FLOOR_SUBSET).map(|_| x1[rng.gen_range(0..n)]).collect();
            let b: Vec<f64> = (0..FLOOR_SUBSET).map(|_| x2[rng.gen_range(0..n)]).collect();
            stats::pearson(&a, &b)
        })
        .collect();
    stats::quantile_floor(&draws, FLOOR_QUANTILE).unwrap_or(0.0)
}

#[derive(Debug, Clone)]
pub struct MeanSquareError {
    pub input1: Field,
    pub input2: Field,
    pub norm: bool,
    /// Bin-shrinkage ratio; `None` disables the shrunk estimate.
    pub shrink: Option<f64>,
    pub mse_est: f64,
    pub mse_val: f64,
}

impl Default for MeanSquareError {
    fn default() -> Self {
        Self {
            input1: Field::Pred,
            input2: Field::Resp,
            norm: true,
            shrink: None,
            mse_est: 1.0,
            mse_val: 1.0,
        }
    }
}

impl MeanSquareError {
    fn score(&self, x1: &[f64], x2: &[f64]) -> f64 {
        match self.shrink {
            Some(ratio) => shrunk_mean_square_error(x1, x2, ratio),
            None => mean_square_error(x1, x2, self.norm),
        }
    }
}

impl Stage for MeanSquareError {
    fn name(&self) -> &'static str {
        "metrics.mean_square_error"
    }

    fn evaluate(
        &mut self,
        input: &[DataContainer],
        state: &mut StackState,
    ) -> Result<Vec<DataContainer>, FitError> {
        let (x1, x2) = paired(input, self.input1, self.input2, is_estimation)?;
        self.mse_est = self.score(&x1, &x2);
        state.meta.insert("mse_est".to_string(), self.mse_est);

        if state.valmode {
            let (v1, v2) = paired(input, self.input1, self.input2, |c| is_validation(c, state))?;
            if !v1.is_empty() {
                self.mse_val = self.score(&v1, &v2);
                state.meta.insert("mse_val".to_string(), self.mse_val);
            }
        }
        Ok(input.to_vec())
    }

    fn objective(&self) -> Option<f64> {
        Some(self.mse_est)
    }
}

/// Pseudo-Huber cost on the relative per-trial error `δ = Σ(pred − resp) / Σ resp`.
#[derive(Debug, Clone)]
pub struct PseudoHuber {
    pub input1: Field,
    pub input2: Field,
    pub b: f64,
    pub huber_est: f64,
    pub huber_val: f64,
}

impl PseudoHuber {
    pub fn new(b: f64) -> Self {
        Self {
            input1: Field::Pred,
            input2: Field::Resp,
            b,
            huber_est: 0.0,
            huber_val: 0.0,
        }
    }

    fn cost<'a>(&self, containers: impl Iterator<Item = &'a DataContainer>) -> Result<f64, FitError> {
        let b2 = self.b * self.b;
        let mut total = 0.0;
        for c in containers {
            let pred = c.require(self.input1)?;
            let resp = c.require(self.input2)?;
            if pred.dim() != resp.dim() {
                return Err(FitError::Shape(format!(
                    "`{}` shape {:?} differs from `{}` shape {:?}",
                    self.input1,
                    pred.shape(),
                    self.input2,
                    resp.shape()
                )));
            }
            for r in 0..resp.len_of(Axis(1)) {
                let p = pred.index_axis(Axis(1), r);
                let y = resp.index_axis(Axis(1), r);
                let delta = (p.sum() - y.sum()) / y.sum();
                if delta.is_finite() {
                    total += 2.0 * b2 * ((1.0 + delta * delta / b2).sqrt() - 1.0);
                }
            }
        }
        Ok(total)
    }
}

impl Stage for PseudoHuber {
    fn name(&self) -> &'static str {
        "metrics.pseudo_huber"
    }

    fn evaluate(
        &mut self,
        input: &[DataContainer],
        state: &mut StackState,
    ) -> Result<Vec<DataContainer>, FitError> {
        self.huber_est = self.cost(input.iter().filter(|c| is_estimation(c)))?;
        state.meta.insert("huber_est".to_string(), self.huber_est);
        if state.valmode && input.iter().any(|c| is_validation(c, state)) {
            self.huber_val = self.cost(input.iter().filter(|c| is_validation(c, state)))?;
            state.meta.insert("huber_val".to_string(), self.huber_val);
        }
        Ok(input.to_vec())
    }

    fn objective(&self) -> Option<f64> {
        Some(self.huber_est)
    }
}

#[derive(Debug, Clone)]
pub struct Correlation {
    pub input1: Field,
    pub input2: Field,
    pub r_est: f64,
    pub r_val: f64,
    pub r_floor: f64,
}

impl Default for Correlation {
    fn default() -> Self {
        Self {
            input1: Field::Pred,
            input2: Field::Resp,
            r_est: 0.0,
            r_val: 0.0,
            r_floor: 0.0,
        }
    }
}

impl Stage for Correlation {
    fn name(&self) -> &'static str {
        "metrics.correlation"
    }

    fn evaluate(
        &mut self,
        input: &[DataContainer],
        state: &mut StackState,
    ) -> Result<Vec<DataContainer>, FitError> {
        let (x1, x2) = paired(input, self.input1, self.input2, is_estimation)?;
        self.r_est = correlation(&x1, &x2);
        state.meta.insert("r_est".to_string(), self.r_est);

        let (v1, v2) = paired(input, self.input1, self.input2, |c| is_validation(c, state))?;
        if !v1.is_empty() {
            self.r_val = correlation(&v1, &v2);
            self.r_floor = noise_floor(&v1, &v2, state.seed);
            state.meta.insert("r_val".to_string(), self.r_val);
            state.meta.insert("r_floor".to_string(), self.r_floor);
        }
        Ok(input.to_vec())
    }

    fn objective(&self) -> Option<f64> {
        Some(1.0 - self.r_est)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::container::tests::averaged;

    #[test]
    fn normalized_mse_scenario() {
        // P = 100, E = 25
        let resp = [6.0, 8.0];
        let pred = [6.0 + 3.0, 8.0 + 4.0];
        assert_eq!(mean_square_error(&pred, &resp, true), 0.25);
        assert_eq!(mean_square_error(&pred, &resp, false), 12.5);
    }

    #[test]
    fn zero_power_mse_is_one() {
        assert_eq!(mean_square_error(&[1.0, 2.0], &[0.0, 0.0], true), 1.0);
        assert_eq!(mean_square_error(&[], &[], false), 1.0);
    }

    #[test]
    fn mse_ignores_non_finite_pairs() {
        let resp = [6.0, f64::NAN, 8.0];
        let pred = [9.0, 1.0, 12.0];
        assert_eq!(mean_square_error(&pred, &resp, true), 0.25);
    }

    #[test]
    fn shrunk_mse_of_perfect_prediction_is_zero() {
        let resp: Vec<f64> = (1..=40).map(f64::from).collect();
        assert_eq!(shrunk_mean_square_error(&resp, &resp, 1.0), 0.0);
    }

    #[test]
    fn shrunk_mse_never_beats_the_raw_estimate_when_noisy() {
        let resp: Vec<f64> = (0..50).map(|i| 1.0 + (i % 5) as f64).collect();
        let pred: Vec<f64> = resp.iter().enumerate().map(|(i, r)| if i < 5 { r + 6.0 } else { *r }).collect();
        let raw = mean_square_error(&pred, &resp, true);
        let shrunk = shrunk_mean_square_error(&pred, &resp, 1.0);
        assert!(shrunk >= raw);
        assert!(shrunk <= 1.0);
    }

    #[test]
    fn correlation_degenerate_cases_are_zero() {
        assert_eq!(correlation(&[0.0, 0.0, 0.0], &[1.0, 2.0, 3.0]), 0.0);
        assert_eq!(correlation(&[1.0, 2.0, 3.0], &[0.0, 0.0, 0.0]), 0.0);
        assert_eq!(correlation(&[2.0, 2.0, 2.0], &[1.0, 2.0, 3.0]), 0.0);
        assert!((correlation(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn noise_floor_is_small_and_seeded() {
        let x1: Vec<f64> = (0..200).map(|i| ((i * 37) % 17) as f64).collect();
        let x2: Vec<f64> = (0..200).map(|i| ((i * 11) % 13) as f64).collect();
        let a = noise_floor(&x1, &x2, 3);
        assert_eq!(a, noise_floor(&x1, &x2, 3));
        assert!(a > 0.0 && a < 0.2, "{a}");
    }

    #[test]
    fn mse_module_scores_estimation_and_validation() {
        let mut est = averaged(vec![1, 1], 2, false);
        est.pred = Some(est.resp.mapv(|r| r + 1.0));
        est.is_estimation = Some(true);
        let mut val = averaged(vec![1, 1], 2, false);
        val.pred = Some(val.resp.clone());
        val.is_estimation = Some(false);

        let mut mse = MeanSquareError::default();
        let mut state = StackState::with_valmode(true);
        let out = mse.evaluate(&[est.clone(), val.clone()], &mut state).unwrap();
        assert_eq!(out, vec![est, val]);
        // resp rows are 0 and 1: E = 4, P = 2
        assert_eq!(mse.mse_est, 2.0);
        assert_eq!(mse.mse_val, 0.0);
        assert_eq!(state.meta["mse_est"], 2.0);
        assert_eq!(mse.objective(), Some(2.0));
    }

    #[test]
    fn validation_containers_of_other_folds_are_ignored() {
        let mut val0 = averaged(vec![1, 1], 2, false);
        val0.pred = Some(val0.resp.clone());
        val0.is_estimation = Some(false);
        val0.fold = Some(0);
        let mut val1 = val0.clone();
        val1.pred = Some(val1.resp.mapv(|r| r + 10.0));
        val1.fold = Some(1);

        let mut mse = MeanSquareError::default();
        let mut state = StackState::with_valmode(true);
        mse.evaluate(&[val0, val1], &mut state).unwrap();
        assert_eq!(mse.mse_val, 0.0);
    }

    #[test]
    fn pseudo_huber_uses_relative_trial_error() {
        let mut d = averaged(vec![1, 1], 2, false);
        // Row 0 sums to zero and is dropped; row 1 doubles.
        d.pred = Some(d.resp.mapv(|r| 2.0 * r));
        let mut huber = PseudoHuber::new(1.0);
        huber.evaluate(&[d], &mut StackState::default()).unwrap();
        let want = 2.0 * (2.0_f64.sqrt() - 1.0);
        assert!((huber.huber_est - want).abs() < 1e-12);
    }

    #[test]
    fn correlation_objective_is_one_minus_r() {
        let mut d = averaged(vec![1, 1, 1], 2, false);
        d.pred = Some(d.resp.mapv(|r| 3.0 * r + 1.0));
        let mut corr = Correlation::default();
        corr.evaluate(&[d], &mut StackState::default()).unwrap();
        assert!((corr.r_est - 1.0).abs() < 1e-12);
        assert!(corr.objective().unwrap().abs() < 1e-12);
    }
}
