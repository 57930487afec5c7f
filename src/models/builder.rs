//! Build and fit a stack from a model name.

use crate::data::DataContainer;
use crate::domain::{Field, FitterKind};
use crate::error::FitError;
use crate::fit::{FitOutcome, FitterOptions, fit, fit_cross_validated};
use crate::modules::{
    Correlation, DcGain, DoubleExponential, Filter, Fir, Gain, MeanSquareError, Metric, Module, Nonlinearity,
    PseudoHuber, PupilGain, SsaIndex, Splitter, WeightChannels,
};
use crate::stack::{Stack, StackState};

use super::keywords::{Keyword, Objective, parse_modelname};

/// Bin-shrinkage ratio used by `mseshr`.
pub const SHRINK_RATIO: f64 = 0.5;

/// Pseudo-Huber linear/quadratic crossover used by `huber`.
pub const HUBER_B: f64 = 0.9;

/// A fitted model and how it got there.
#[derive(Debug)]
pub struct ModelFit {
    pub modelname: String,
    pub stack: Stack,
    /// One outcome per fit run (one per fold when cross-validated).
    pub outcomes: Vec<FitOutcome>,
    pub cross_validated: bool,
}

impl ModelFit {
    pub fn meta(&self, key: &str) -> f64 {
        self.stack.state.meta.get(key).copied().unwrap_or(f64::NAN)
    }
}

/// Assemble the stack named by `modelname` on `data`, fit it and score it.
///
/// `opts` supplies tolerance and iteration limits; the optimizer itself comes
/// from the model's `fitNN` keyword. A model without one is evaluated with
/// its initial parameters.
pub fn fit_model(
    data: DataContainer,
    modelname: &str,
    state: StackState,
    opts: &FitterOptions,
) -> Result<ModelFit, FitError> {
    let keywords = parse_modelname(modelname)?;
    let mut stack = Stack::new(vec![data], state);
    let mut fitter: Option<FitterKind> = None;
    let mut objective = Objective::default();
    let mut score_ssa = false;

    for keyword in keywords {
        match keyword {
            Keyword::StandardSplit => stack.append(Module::Split(Splitter::Standard))?,
            Keyword::CrossValidation { validation_fraction } => {
                stack.append(Module::Split(Splitter::cross_validation(validation_fraction)?))?
            }
            Keyword::WeightChannels(n) => {
                let mut wc = WeightChannels::new(n);
                wc.input = prediction_or_stimulus(&stack);
                stack.append(Module::Filter(Filter::WeightChannels(wc)))?
            }
            Keyword::Fir(n) => {
                let mut fir = Fir::new(n);
                fir.input = prediction_or_stimulus(&stack);
                stack.append(Module::Filter(Filter::Fir(fir)))?
            }
            Keyword::DcGain => stack.append(Module::Gain(Gain::Dc(DcGain::default())))?,
            Keyword::DoubleExponential => stack.append(Module::Nonlinearity(Nonlinearity::DoubleExponential(
                DoubleExponential::default(),
            )))?,
            Keyword::PupilGain(kind) => {
                stack.append(Module::Gain(Gain::Pupil(PupilGain::new(kind))))?;
                mini_fit(&mut stack, kind.name(), opts)?;
            }
            Keyword::Objective(kind) => objective = kind,
            Keyword::SsaIndex => score_ssa = true,
            Keyword::Fit(kind) => fitter = Some(kind),
        }
    }

    // The first metric appended is the one the fitter minimizes.
    match objective {
        Objective::MeanSquareError => {}
        Objective::ShrunkMeanSquareError => stack.append(Module::Metric(Metric::MeanSquareError(MeanSquareError {
            shrink: Some(SHRINK_RATIO),
            ..MeanSquareError::default()
        })))?,
        Objective::PseudoHuber => stack.append(Module::Metric(Metric::PseudoHuber(PseudoHuber::new(HUBER_B))))?,
    }
    if objective != Objective::ShrunkMeanSquareError {
        stack.append(Module::Metric(Metric::MeanSquareError(MeanSquareError::default())))?;
    }
    stack.append(Module::Metric(Metric::Correlation(Correlation::default())))?;
    if score_ssa {
        stack.append(Module::Metric(Metric::SsaIndex(SsaIndex::default())))?;
    }

    let cross_validated = stack
        .modules
        .iter()
        .any(|m| matches!(m, Module::Split(Splitter::CrossValidation { .. })));
    let outcomes = match fitter {
        None => {
            log::info!("{modelname}: no fit keyword, keeping initial parameters");
            Vec::new()
        }
        Some(kind) => {
            let opts = FitterOptions {
                kind,
                modules: None,
                ..opts.clone()
            };
            if cross_validated {
                fit_cross_validated(&mut stack, &opts)?
            } else {
                vec![fit(&mut stack, &opts)?]
            }
        }
    };

    Ok(ModelFit {
        modelname: modelname.to_string(),
        stack,
        outcomes,
        cross_validated,
    })
}

/// Filters read the running prediction once one exists.
fn prediction_or_stimulus(stack: &Stack) -> Field {
    if stack.output().first().is_some_and(|c| c.pred.is_some()) {
        Field::Pred
    } else {
        Field::Stim
    }
}

/// Fit only the module named `name` against a temporary MSE metric.
fn mini_fit(stack: &mut Stack, name: &str, opts: &FitterOptions) -> Result<(), FitError> {
    stack.append(Module::Metric(Metric::MeanSquareError(MeanSquareError::default())))?;
    let mini = FitterOptions {
        kind: FitterKind::NelderMead,
        modules: Some(vec![name.to_string()]),
        ..opts.clone()
    };
    let result = fit(stack, &mini);
    stack.pop_module();
    let outcome = result?;
    log::info!("{name}: quick fit objective {:.6}", outcome.objective);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SyntheticSpec, generate_recording};

    fn synthetic() -> DataContainer {
        let spec = SyntheticSpec {
            stimuli: 10,
            time_bins: 40,
            ..SyntheticSpec::default()
        };
        generate_recording(&spec).unwrap().into_container().unwrap()
    }

    fn quick() -> FitterOptions {
        FitterOptions {
            tolerance: 1e-4,
            max_iter: 200,
            ..FitterOptions::default()
        }
    }

    #[test]
    fn standard_model_reports_estimation_and_validation_metrics() {
        let fit = fit_model(synthetic(), "stdval_fir04_dc_fit00", StackState::with_valmode(true), &quick()).unwrap();
        assert!(!fit.cross_validated);
        assert_eq!(fit.outcomes.len(), 1);
        assert_eq!(
            fit.stack.describe(),
            "split.standard > filters.fir > gain.dc > metrics.mean_square_error > metrics.correlation"
        );
        assert!(fit.meta("r_est") > 0.0);
        assert!(fit.meta("r_val").is_finite());
        assert!(fit.meta("mse_est") < 1.0);
    }

    #[test]
    fn pupil_gain_is_quick_fit_on_append() {
        let fit = fit_model(synthetic(), "stdval_fir04_pupgain", StackState::with_valmode(true), &quick()).unwrap();
        assert!(fit.outcomes.is_empty());
        let gain = fit.stack.find_modules("pupil.pupgain");
        assert_eq!(gain, vec![2]);
        assert_ne!(fit.stack.modules[2].fit_parameters(), vec![0.0, 1.0, 0.0, 0.0]);
        // The temporary metric is gone.
        assert_eq!(fit.stack.modules.len(), 5);
    }

    #[test]
    fn cross_validated_model_runs_each_fold() {
        let fit = fit_model(synthetic(), "xval25_fir02_fit01", StackState::with_valmode(true), &quick()).unwrap();
        assert!(fit.cross_validated);
        assert_eq!(fit.outcomes.len(), 3);
        assert!(fit.meta("r_val").is_finite());
    }

    #[test]
    fn huber_keyword_makes_pseudo_huber_the_objective() {
        let fit = fit_model(synthetic(), "stdval_fir03_huber_fit00", StackState::with_valmode(true), &quick()).unwrap();
        assert_eq!(
            fit.stack.describe(),
            "split.standard > filters.fir > metrics.pseudo_huber > metrics.mean_square_error > metrics.correlation"
        );
        assert_eq!(fit.stack.objective_index(), Some(2));
        assert!((fit.outcomes[0].objective - fit.meta("huber_est")).abs() < 1e-9);
        assert!(fit.meta("huber_val").is_finite());
        assert!(fit.meta("mse_est").is_finite());
    }

    #[test]
    fn mseshr_keyword_shrinks_the_fitted_error() {
        let fit = fit_model(synthetic(), "stdval_fir03_mseshr", StackState::with_valmode(true), &quick()).unwrap();
        let Module::Metric(Metric::MeanSquareError(mse)) = &fit.stack.modules[2] else {
            panic!("expected the mse metric after the filter");
        };
        assert_eq!(mse.shrink, Some(SHRINK_RATIO));
        assert_eq!(fit.stack.modules.len(), 4);
    }

    #[test]
    fn ssa_keyword_scores_adaptation() {
        use crate::domain::ResponseLayout;
        use ndarray::Array3;

        // Two-stream oddball: per trial one stream plays four 2-bin tones,
        // the other one tone. The response follows stream 0 strongly.
        let mut stim = Array3::zeros((2, 2, 40));
        for (trial, standard) in [(0, 0), (1, 1)] {
            for on in [4, 12, 20, 28] {
                for t in on..on + 2 {
                    stim[[standard, trial, t]] = 1.0;
                }
            }
            for t in 24..26 {
                stim[[1 - standard, trial, t]] = 1.0;
            }
        }
        let resp = Array3::from_shape_fn((1, 2, 40), |(_, r, t)| {
            2.0 * stim[[0, r, t]] + 0.5 * stim[[1, r, t]] + 0.1
        });
        let data = DataContainer::new(stim, resp, None, vec![1, 1], None, ResponseLayout::Averaged, 100.0).unwrap();

        let fit = fit_model(data, "fir02_ssa", StackState::default(), &quick()).unwrap();
        assert!(fit.stack.describe().ends_with("metrics.correlation > metrics.ssa_index"));
        assert!(fit.meta("si_cell").is_finite());
        assert!(fit.meta("si_stream0").is_finite());
    }

    #[test]
    fn unknown_keyword_stops_the_build() {
        let err = fit_model(synthetic(), "stdval_bogus", StackState::default(), &quick()).unwrap_err();
        assert!(matches!(err, FitError::UnknownKeyword(k) if k == "bogus"));
    }
}
