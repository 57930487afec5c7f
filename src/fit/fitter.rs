//! Local optimizers over a stack's fit parameters.
//!
//! Given:
//! - a stack whose modules expose `fit_fields`
//! - a metric module whose objective should be minimized
//!
//! we repeatedly:
//! - write a candidate parameter vector back into the modules
//! - re-evaluate the stack from the first fitted module up to the metric
//! - read the metric's objective
//!
//! and stop once the objective changes by less than `tolerance` or
//! `max_iter` iterations have run. Only a local minimum is sought.

use nalgebra::DVector;

use crate::domain::FitterKind;
use crate::error::FitError;
use crate::stack::Stack;

/// Relative simplex step for a non-zero starting value.
const NONZERO_STEP: f64 = 0.05;
/// Absolute simplex step for a starting value of exactly zero.
const ZERO_STEP: f64 = 0.00025;

/// Options that control a single fit.
#[derive(Debug, Clone)]
pub struct FitterOptions {
    pub kind: FitterKind,
    pub tolerance: f64,
    pub max_iter: usize,

    /// Starting step of coordinate descent (scaled by `max(|x|, 1)`).
    pub initial_step: f64,

    /// Restrict fitting to modules with these names.
    ///
    /// `None` fits every module with parameters. Used for the quick "mini fit"
    /// of a freshly appended gain module.
    pub modules: Option<Vec<String>>,
}

impl Default for FitterOptions {
    fn default() -> Self {
        Self {
            kind: FitterKind::NelderMead,
            tolerance: 1e-6,
            max_iter: 2000,
            initial_step: 0.1,
            modules: None,
        }
    }
}

/// What a fit did.
#[derive(Debug, Clone, PartialEq)]
pub struct FitOutcome {
    pub kind: FitterKind,
    /// Objective at the returned parameters.
    pub objective: f64,
    pub iterations: usize,
    pub evaluations: usize,
    pub converged: bool,
    /// Number of values varied.
    pub parameter_count: usize,
}

/// The stack seen as a function of its flat fit-parameter vector.
struct Problem<'a> {
    stack: &'a mut Stack,
    /// `(module index, parameter count)` of every fitted module.
    fitted: Vec<(usize, usize)>,
    start: usize,
    metric: usize,
    evaluations: usize,
}

impl Problem<'_> {
    fn initial(&self) -> DVector<f64> {
        let values: Vec<f64> = self
            .fitted
            .iter()
            .flat_map(|&(i, _)| self.stack.modules[i].fit_parameters())
            .collect();
        DVector::from_vec(values)
    }

    fn write(&mut self, x: &DVector<f64>) -> Result<(), FitError> {
        let mut offset = 0;
        for &(i, n) in &self.fitted {
            self.stack.modules[i].set_fit_parameters(&x.as_slice()[offset..offset + n])?;
            offset += n;
        }
        Ok(())
    }

    /// Objective at `x`; non-finite values count as `+∞`.
    fn cost(&mut self, x: &DVector<f64>) -> Result<f64, FitError> {
        self.write(x)?;
        self.stack.evaluate_range(self.start, self.metric + 1)?;
        self.evaluations += 1;
        let value = self.stack.modules[self.metric].objective().unwrap_or(f64::INFINITY);
        Ok(if value.is_finite() { value } else { f64::INFINITY })
    }
}

/// Minimize the stack's objective metric over the selected modules' parameters.
///
/// On return the best parameters are written into the modules and the whole
/// stack has been re-evaluated with them.
pub fn fit(stack: &mut Stack, opts: &FitterOptions) -> Result<FitOutcome, FitError> {
    let metric = stack
        .objective_index()
        .ok_or_else(|| FitError::Configuration("stack has no metric module to minimize".to_string()))?;

    let fitted: Vec<(usize, usize)> = stack.modules[..metric]
        .iter()
        .enumerate()
        .filter(|(_, m)| {
            opts.modules
                .as_ref()
                .is_none_or(|names| names.iter().any(|n| n == m.name()))
        })
        .map(|(i, m)| (i, m.parameter_count()))
        .filter(|&(_, n)| n > 0)
        .collect();

    let parameter_count = fitted.iter().map(|&(_, n)| n).sum();
    let Some(start) = fitted.first().map(|&(i, _)| i) else {
        log::warn!("Nothing to fit before {}; evaluating only.", stack.modules[metric].name());
        stack.evaluate(0)?;
        return Ok(FitOutcome {
            kind: opts.kind,
            objective: stack.modules[metric].objective().unwrap_or(f64::INFINITY),
            iterations: 0,
            evaluations: 1,
            converged: true,
            parameter_count: 0,
        });
    };

    log::info!(
        "Fitting {parameter_count} parameters with {} (tolerance {:e}, max {} iterations)",
        opts.kind.display_name(),
        opts.tolerance,
        opts.max_iter
    );

    let mut problem = Problem {
        stack,
        fitted,
        start,
        metric,
        evaluations: 0,
    };
    let x0 = problem.initial();
    let result = match opts.kind {
        FitterKind::NelderMead => nelder_mead(&mut problem, x0, opts)?,
        FitterKind::CoordinateDescent => coordinate_descent(&mut problem, x0, opts)?,
    };

    problem.write(&result.x)?;
    let evaluations = problem.evaluations;
    problem.stack.evaluate(start)?;
    let objective = problem.stack.modules[metric]
        .objective()
        .filter(|v| v.is_finite())
        .unwrap_or(f64::INFINITY);

    log::info!(
        "Fit finished after {} iterations ({evaluations} evaluations): objective {objective:.6}{}",
        result.iterations,
        if result.converged { "" } else { " (iteration limit)" }
    );

    Ok(FitOutcome {
        kind: opts.kind,
        objective,
        iterations: result.iterations,
        evaluations,
        converged: result.converged,
        parameter_count,
    })
}

struct Minimum {
    x: DVector<f64>,
    iterations: usize,
    converged: bool,
}

/// Downhill simplex with the usual coefficients (reflect 1, expand 2,
/// contract 1/2, shrink 1/2).
fn nelder_mead(problem: &mut Problem<'_>, x0: DVector<f64>, opts: &FitterOptions) -> Result<Minimum, FitError> {
    let n = x0.len();
    let mut simplex: Vec<(DVector<f64>, f64)> = Vec::with_capacity(n + 1);
    let f0 = problem.cost(&x0)?;
    simplex.push((x0.clone(), f0));
    for i in 0..n {
        let mut x = x0.clone();
        x[i] = if x[i] != 0.0 { x[i] * (1.0 + NONZERO_STEP) } else { ZERO_STEP };
        let f = problem.cost(&x)?;
        simplex.push((x, f));
    }

    let mut iterations = 0;
    loop {
        simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
        let best = simplex[0].1;
        let worst = simplex[n].1;
        let spread = simplex.iter().map(|(_, f)| (f - best).abs()).fold(0.0, f64::max);
        if spread <= opts.tolerance || (best == f64::INFINITY && worst == f64::INFINITY) {
            return Ok(Minimum {
                x: simplex.swap_remove(0).0,
                iterations,
                converged: true,
            });
        }
        if iterations >= opts.max_iter {
            return Ok(Minimum {
                x: simplex.swap_remove(0).0,
                iterations,
                converged: false,
            });
        }
        iterations += 1;

        let centroid = simplex[..n]
            .iter()
            .fold(DVector::zeros(n), |acc, (x, _)| acc + x)
            / n as f64;
        let worst_x = simplex[n].0.clone();

        let reflected = &centroid + (&centroid - &worst_x);
        let f_reflected = problem.cost(&reflected)?;

        if f_reflected < simplex[0].1 {
            let expanded = &centroid + (&reflected - &centroid) * 2.0;
            let f_expanded = problem.cost(&expanded)?;
            simplex[n] = if f_expanded < f_reflected {
                (expanded, f_expanded)
            } else {
                (reflected, f_reflected)
            };
            continue;
        }
        if f_reflected < simplex[n - 1].1 {
            simplex[n] = (reflected, f_reflected);
            continue;
        }

        // Contract toward the better of the worst point and its reflection.
        let (toward, f_toward) = if f_reflected < worst {
            (reflected, f_reflected)
        } else {
            (worst_x, worst)
        };
        let contracted = &centroid + (&toward - &centroid) * 0.5;
        let f_contracted = problem.cost(&contracted)?;
        if f_contracted < f_toward {
            simplex[n] = (contracted, f_contracted);
            continue;
        }

        let best_x = simplex[0].0.clone();
        for vertex in simplex.iter_mut().skip(1) {
            let x = &best_x + (&vertex.0 - &best_x) * 0.5;
            let f = problem.cost(&x)?;
            *vertex = (x, f);
        }
    }
}

/// Vary one parameter at a time by `±step`; halve the step after a sweep
/// that improves the objective by less than `tolerance`.
fn coordinate_descent(
    problem: &mut Problem<'_>,
    x0: DVector<f64>,
    opts: &FitterOptions,
) -> Result<Minimum, FitError> {
    let n = x0.len();
    let mut x = x0;
    let mut f = problem.cost(&x)?;
    let mut steps: Vec<f64> = x.iter().map(|v| opts.initial_step * v.abs().max(1.0)).collect();

    let mut iterations = 0;
    while iterations < opts.max_iter {
        iterations += 1;
        let before = f;
        for i in 0..n {
            for direction in [1.0, -1.0] {
                let mut candidate = x.clone();
                candidate[i] += direction * steps[i];
                let fc = problem.cost(&candidate)?;
                if fc < f {
                    x = candidate;
                    f = fc;
                    break;
                }
            }
        }
        let improvement = before - f;
        if !(improvement >= opts.tolerance) {
            if steps.iter().all(|&s| s < opts.tolerance) {
                return Ok(Minimum {
                    x,
                    iterations,
                    converged: true,
                });
            }
            for s in steps.iter_mut() {
                *s *= 0.5;
            }
        }
    }
    Ok(Minimum {
        x,
        iterations,
        converged: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::container::tests::averaged;
    use crate::modules::{DcGain, Gain, MeanSquareError, Metric, Module, Splitter};
    use crate::stack::StackState;

    /// Prediction `2 * resp + 1`, which a DC gain of `(-0.5, 0.5)` undoes.
    fn dc_stack() -> Stack {
        let mut d = averaged(vec![1, 1, 1, 1, 1, 2], 5, false);
        d.resp = d.resp.mapv(|r| r + 1.0);
        d.pred = Some(d.resp.mapv(|r| 2.0 * r + 1.0));
        let mut stack = Stack::new(vec![d], StackState::with_valmode(true));
        stack.append(Module::Split(Splitter::Standard)).unwrap();
        stack.append(Module::Gain(Gain::Dc(DcGain::default()))).unwrap();
        stack
            .append(Module::Metric(Metric::MeanSquareError(MeanSquareError::default())))
            .unwrap();
        stack
    }

    fn assert_recovers(kind: FitterKind) {
        let mut stack = dc_stack();
        let opts = FitterOptions {
            kind,
            tolerance: 1e-12,
            max_iter: 20_000,
            ..FitterOptions::default()
        };
        let outcome = fit(&mut stack, &opts).unwrap();
        assert_eq!(outcome.parameter_count, 2);
        assert!(outcome.objective < 1e-6, "{outcome:?}");
        let theta = stack.modules[1].fit_parameters();
        assert!((theta[0] + 0.5).abs() < 1e-2, "{theta:?}");
        assert!((theta[1] - 0.5).abs() < 1e-2, "{theta:?}");
        // Validation data was scored with the fitted parameters too.
        assert!(stack.state.meta["mse_val"] < 1e-4);
    }

    #[test]
    fn nelder_mead_recovers_dc_gain() {
        assert_recovers(FitterKind::NelderMead);
    }

    #[test]
    fn coordinate_descent_recovers_dc_gain() {
        assert_recovers(FitterKind::CoordinateDescent);
    }

    #[test]
    fn iteration_limit_is_reported() {
        let mut stack = dc_stack();
        let opts = FitterOptions {
            max_iter: 3,
            tolerance: 0.0,
            ..FitterOptions::default()
        };
        let outcome = fit(&mut stack, &opts).unwrap();
        assert!(!outcome.converged);
        assert_eq!(outcome.iterations, 3);
    }

    #[test]
    fn module_filter_limits_what_is_fit() {
        let mut stack = dc_stack();
        let opts = FitterOptions {
            modules: Some(vec!["filters.fir".to_string()]),
            ..FitterOptions::default()
        };
        let outcome = fit(&mut stack, &opts).unwrap();
        assert_eq!(outcome.parameter_count, 0);
        assert_eq!(stack.modules[1].fit_parameters(), vec![0.0, 1.0]);
    }

    #[test]
    fn stack_without_metric_cannot_be_fit() {
        let mut stack = dc_stack();
        stack.pop_module();
        let err = fit(&mut stack, &FitterOptions::default()).unwrap_err();
        assert!(matches!(err, FitError::Configuration(_)));
    }
}
