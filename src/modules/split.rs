//! Estimation/validation splitters.
//!
//! A splitter is the first module of every stack. Containers that are already
//! split pass through untouched (validation ones only in validation mode), so a
//! splitter never re-splits its own output.

use crate::data::DataContainer;
use crate::domain::ResponseLayout;
use crate::error::FitError;
use crate::stack::StackState;

use super::Stage;

/// Slack for the ceiling in the fold arithmetic, so that `1/0.05` counts as 20.
const CEIL_SLACK: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub enum Splitter {
    /// Highest-repetition stimuli become validation data.
    Standard,
    /// Contiguous trial folds; fold `state.fold_index` is held out.
    CrossValidation { validation_fraction: f64 },
}

impl Splitter {
    pub fn cross_validation(validation_fraction: f64) -> Result<Self, FitError> {
        if !(validation_fraction.is_finite() && validation_fraction > 0.0 && validation_fraction < 1.0) {
            return Err(FitError::Configuration(format!(
                "validation fraction must lie in (0, 1), got {validation_fraction}"
            )));
        }
        Ok(Splitter::CrossValidation { validation_fraction })
    }
}

/// `ceil(1 / fraction) - 1`.
pub fn fold_count_for(validation_fraction: f64) -> usize {
    ceil_slack(1.0 / validation_fraction).saturating_sub(1)
}

/// `ceil(trials * fraction)`.
pub fn fold_size_for(trials: usize, validation_fraction: f64) -> usize {
    ceil_slack(trials as f64 * validation_fraction)
}

fn ceil_slack(x: f64) -> usize {
    (x - CEIL_SLACK).ceil().max(0.0) as usize
}

fn fold_rows(fold: usize, size: usize, trials: usize) -> std::ops::Range<usize> {
    (fold * size).min(trials)..((fold + 1) * size).min(trials)
}

impl Stage for Splitter {
    fn name(&self) -> &'static str {
        match self {
            Splitter::Standard => "split.standard",
            Splitter::CrossValidation { .. } => "split.crossval",
        }
    }

    fn initialize(&mut self, _input: &[DataContainer], state: &mut StackState) -> Result<(), FitError> {
        if let Splitter::CrossValidation { validation_fraction } = self {
            if state.fold_count == 0 {
                state.fold_count = fold_count_for(*validation_fraction);
            }
        }
        Ok(())
    }

    fn evaluate(
        &mut self,
        input: &[DataContainer],
        state: &mut StackState,
    ) -> Result<Vec<DataContainer>, FitError> {
        let mut out = Vec::with_capacity(input.len() * 2);
        for d in input {
            match d.is_estimation {
                Some(true) => out.push(d.clone()),
                Some(false) => {
                    if state.valmode {
                        out.push(d.clone());
                    }
                }
                None => match self {
                    Splitter::Standard => standard_split(d, state.valmode, &mut out)?,
                    Splitter::CrossValidation { validation_fraction } => {
                        if state.fold_count == 0 {
                            state.fold_count = fold_count_for(*validation_fraction);
                        }
                        cross_validation_split(d, *validation_fraction, state, &mut out)?
                    }
                },
            }
        }
        Ok(out)
    }
}

fn repetition_masks(counts: &[usize]) -> (Vec<bool>, Vec<bool>) {
    let max = counts.iter().copied().max().unwrap_or(0);
    let estimation = counts.iter().map(|&n| n < max).collect();
    let validation = counts.iter().map(|&n| n == max).collect();
    (estimation, validation)
}

fn standard_split(d: &DataContainer, valmode: bool, out: &mut Vec<DataContainer>) -> Result<(), FitError> {
    if d.repetition_count.len() < 2 {
        return Err(FitError::Configuration(format!(
            "standard split needs at least two stimuli, found {}",
            d.repetition_count.len()
        )));
    }

    let mut counts = d.repetition_count.clone();
    let (mut est_mask, mut val_mask) = repetition_masks(&counts);
    if !est_mask.iter().any(|&keep| keep) {
        // All stimuli share one repetition count. Bumping the last count keeps
        // an estimation set; the perturbed count is what the outputs report.
        let last = counts.len() - 1;
        counts[last] += 1;
        log::warn!(
            "All stimuli have {} repetitions; treating stimulus {last} as having {} for the split.",
            counts[0],
            counts[last]
        );
        (est_mask, val_mask) = repetition_masks(&counts);
    }

    let stimuli = d.stimulus_of_rows();
    let mut est = restricted(d, &stimuli, &counts, &est_mask);
    est.is_estimation = Some(true);
    out.push(est);

    if valmode {
        let mut val = restricted(d, &stimuli, &counts, &val_mask);
        val.is_estimation = Some(false);
        out.push(val);
    }
    Ok(())
}

/// Rows whose stimulus is in `mask`, with repetition bookkeeping re-indexed.
fn restricted(d: &DataContainer, stimuli: &[usize], counts: &[usize], mask: &[bool]) -> DataContainer {
    let rows: Vec<usize> = stimuli
        .iter()
        .enumerate()
        .filter(|&(_, &s)| mask[s])
        .map(|(r, _)| r)
        .collect();
    let mut sub = d.select_trials(&rows);
    match d.layout {
        ResponseLayout::Averaged => {
            sub.repetition_count = rows.iter().map(|&r| counts[r]).collect();
        }
        ResponseLayout::PerTrial => {
            let mut remap = vec![0; counts.len()];
            let mut kept = Vec::new();
            for (s, (&n, &keep)) in counts.iter().zip(mask).enumerate() {
                if keep {
                    remap[s] = kept.len();
                    kept.push(n);
                }
            }
            sub.repetition_count = kept;
            if let Some(replist) = sub.replist.as_mut() {
                for s in replist.iter_mut() {
                    *s = remap[*s];
                }
            }
        }
    }
    sub
}

fn cross_validation_split(
    d: &DataContainer,
    validation_fraction: f64,
    state: &mut StackState,
    out: &mut Vec<DataContainer>,
) -> Result<(), FitError> {
    let trials = d.trial_count();
    if trials < state.fold_count {
        return Err(FitError::Configuration(format!(
            "{trials} trials cannot fill {} cross-validation folds; use a larger validation fraction",
            state.fold_count
        )));
    }
    if state.fold_index >= state.fold_count {
        return Err(FitError::Configuration(format!(
            "fold {} requested but only {} folds exist",
            state.fold_index, state.fold_count
        )));
    }

    let size = fold_size_for(trials, validation_fraction);
    let held_out = fold_rows(state.fold_index, size, trials);
    let est_rows: Vec<usize> = (0..trials).filter(|r| !held_out.contains(r)).collect();
    if est_rows.is_empty() {
        return Err(FitError::Configuration(format!(
            "validation fraction {validation_fraction} holds out all {trials} trials in fold {}; \
             use a smaller validation fraction",
            state.fold_index
        )));
    }
    let mut est = d.select_trials(&est_rows);
    est.is_estimation = Some(true);
    est.fold = Some(state.fold_index);
    out.push(est);

    if state.valmode {
        let mut folds: Vec<DataContainer> = (0..state.fold_count)
            .map(|j| {
                let rows: Vec<usize> = fold_rows(j, size, trials).collect();
                let mut val = d.select_trials(&rows);
                val.is_estimation = Some(false);
                val.fold = Some(j);
                val
            })
            .collect();
        while folds.last().is_some_and(|v| v.trial_count() == 0) {
            folds.pop();
            state.fold_count -= 1;
            log::warn!(
                "Trailing cross-validation fold is empty; continuing with {} folds.",
                state.fold_count
            );
        }
        out.extend(folds);
    }
    Ok(())
}
