//! Cross-validated fitting.
//!
//! Each fold refits the model from the same starting parameters with that
//! fold's trials held out. The held-out predictions of all folds are stitched
//! into one validation container, which the trailing metric modules then score,
//! so `r_val`/`mse_val` are out-of-sample for every held-out trial.

use crate::data::{DataContainer, concat_trials};
use crate::error::FitError;
use crate::modules::Module;
use crate::stack::Stack;

use super::fitter::{FitOutcome, FitterOptions, fit};

/// Fit every cross-validation fold and score the stitched validation predictions.
///
/// The stack's first module must be a splitter and its metric modules must be
/// at the end. The fold count is re-read from the stack state every iteration
/// because evaluating the splitter may drop an empty trailing fold.
pub fn fit_cross_validated(stack: &mut Stack, opts: &FitterOptions) -> Result<Vec<FitOutcome>, FitError> {
    let splitter = stack
        .modules
        .iter()
        .position(Module::is_splitter)
        .ok_or_else(|| FitError::Configuration("cross-validated fit needs a splitter module".to_string()))?;
    let metric = stack
        .objective_index()
        .ok_or_else(|| FitError::Configuration("stack has no metric module to minimize".to_string()))?;
    if metric <= splitter || !stack.modules[metric..].iter().all(Module::is_metric) {
        return Err(FitError::Configuration(
            "metric modules must come last, after the splitter".to_string(),
        ));
    }

    let initial = stack.parameters();
    let mut outcomes = Vec::new();
    let mut held_out: Vec<DataContainer> = Vec::new();
    let mut fold = 0;
    while fold < stack.state.fold_count.max(1) {
        stack.state.fold_index = fold;
        stack.restore_parameters(&initial)?;
        stack.evaluate(splitter)?;
        if fold >= stack.state.fold_count.max(1) {
            break;
        }

        log::info!("Fitting fold {}/{}", fold + 1, stack.state.fold_count.max(1));
        outcomes.push(fit(stack, opts)?);

        held_out.extend(
            stack
                .output_of(metric - 1)
                .iter()
                .filter(|c| c.is_estimation == Some(false) && c.fold.is_none_or(|f| f == fold))
                .cloned(),
        );
        fold += 1;
    }

    if held_out.is_empty() {
        return Ok(outcomes);
    }

    let mut scored: Vec<DataContainer> = stack
        .output_of(metric - 1)
        .iter()
        .filter(|c| c.is_estimation != Some(false))
        .cloned()
        .collect();
    scored.push(concat_trials(&held_out)?);
    stack.replace_output(metric - 1, scored)?;
    stack.evaluate(metric)?;
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::container::tests::averaged;
    use crate::modules::{Correlation, DcGain, Gain, MeanSquareError, Metric, Splitter};
    use crate::stack::StackState;

    fn xval_stack(trials: usize, fraction: f64) -> Stack {
        let mut d = averaged(vec![1; trials], 4, false);
        d.resp = d.resp.mapv(|r| r + 1.0);
        d.pred = Some(d.resp.mapv(|r| 3.0 * r - 1.0));
        let mut stack = Stack::new(vec![d], StackState::with_valmode(true));
        stack
            .append(Module::Split(Splitter::cross_validation(fraction).unwrap()))
            .unwrap();
        stack.append(Module::Gain(Gain::Dc(DcGain::default()))).unwrap();
        stack
            .append(Module::Metric(Metric::MeanSquareError(MeanSquareError::default())))
            .unwrap();
        stack
            .append(Module::Metric(Metric::Correlation(Correlation::default())))
            .unwrap();
        stack
    }

    #[test]
    fn every_fold_is_fit_and_validation_is_stitched() {
        let mut stack = xval_stack(10, 0.2);
        assert_eq!(stack.state.fold_count, 4);
        let outcomes = fit_cross_validated(&mut stack, &FitterOptions::default()).unwrap();
        assert_eq!(outcomes.len(), 4);

        let out = stack.output();
        let val: Vec<_> = out.iter().filter(|c| c.is_estimation == Some(false)).collect();
        assert_eq!(val.len(), 1);
        // Four folds of two trials; the last two trials are never held out.
        assert_eq!(val[0].trial_count(), 8);
        assert!(stack.state.meta["r_val"] > 0.99);
        assert!(stack.state.meta["mse_val"] < 1e-3);
    }

    #[test]
    fn truncated_fold_count_is_respected() {
        let mut stack = xval_stack(4, 0.3);
        let outcomes = fit_cross_validated(&mut stack, &FitterOptions::default()).unwrap();
        assert_eq!(stack.state.fold_count, 2);
        assert_eq!(outcomes.len(), 2);
        let val: Vec<_> = stack
            .output()
            .iter()
            .filter(|c| c.is_estimation == Some(false))
            .map(|c| c.trial_count())
            .collect();
        assert_eq!(val, vec![4]);
    }

    #[test]
    fn standard_split_is_a_single_fold() {
        let mut d = averaged(vec![1, 1, 1, 4], 4, false);
        d.pred = Some(d.resp.mapv(|r| r + 2.0));
        let mut stack = Stack::new(vec![d], StackState::with_valmode(true));
        stack.append(Module::Split(Splitter::Standard)).unwrap();
        stack.append(Module::Gain(Gain::Dc(DcGain::default()))).unwrap();
        stack
            .append(Module::Metric(Metric::MeanSquareError(MeanSquareError::default())))
            .unwrap();
        let outcomes = fit_cross_validated(&mut stack, &FitterOptions::default()).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(stack.output().len(), 2);
        assert_eq!(stack.output()[1].trial_count(), 1);
    }
}
