//! Stack modules.
//!
//! Every pipeline stage is one variant of the closed [`Module`] enum, grouped by
//! family (split, filter, gain, nonlinearity, metric). All variants share one
//! contract, the [`Stage`] trait: consume the previous module's output list and
//! build a fresh output list, optionally exposing fittable parameters and an
//! objective value.

use ndarray::Array3;

use crate::data::DataContainer;
use crate::error::FitError;
use crate::stack::StackState;

pub mod filters;
pub mod gain;
pub mod metrics;
pub mod nonlinearity;
pub mod split;
pub mod ssa;

pub use filters::{Fir, WeightChannels};
pub use gain::{DcGain, GainKind, PupilGain};
pub use metrics::{Correlation, MeanSquareError, PseudoHuber};
pub use nonlinearity::DoubleExponential;
pub use split::Splitter;
pub use ssa::{SsaIndex, SsaResult};

/// A named parameter block that the fitter may vary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    Coefs,
    Baseline,
    Theta,
}

impl Param {
    pub fn as_str(self) -> &'static str {
        match self {
            Param::Coefs => "coefs",
            Param::Baseline => "baseline",
            Param::Theta => "theta",
        }
    }
}

/// Shared contract implemented by every concrete module.
pub trait Stage {
    /// Stable identifier used for lookup within a stack.
    fn name(&self) -> &'static str;

    /// Build this module's output list from scratch.
    fn evaluate(
        &mut self,
        input: &[DataContainer],
        state: &mut StackState,
    ) -> Result<Vec<DataContainer>, FitError>;

    /// Data-dependent setup, run once when the module joins a stack.
    fn initialize(&mut self, _input: &[DataContainer], _state: &mut StackState) -> Result<(), FitError> {
        Ok(())
    }

    /// Parameter blocks the fitter is allowed to vary, in order.
    fn fit_fields(&self) -> &[Param] {
        &[]
    }

    fn param(&self, _param: Param) -> Option<Vec<f64>> {
        None
    }

    fn set_param(&mut self, param: Param, _values: &[f64]) -> Result<(), FitError> {
        Err(FitError::Configuration(format!(
            "{} has no `{}` parameter",
            self.name(),
            param.as_str()
        )))
    }

    /// Scalar error on the estimation data, for metric modules.
    fn objective(&self) -> Option<f64> {
        None
    }
}

#[derive(Debug, Clone)]
pub enum Filter {
    WeightChannels(WeightChannels),
    Fir(Fir),
}

#[derive(Debug, Clone)]
pub enum Gain {
    Dc(DcGain),
    Pupil(PupilGain),
}

#[derive(Debug, Clone)]
pub enum Nonlinearity {
    DoubleExponential(DoubleExponential),
}

#[derive(Debug, Clone)]
pub enum Metric {
    MeanSquareError(MeanSquareError),
    PseudoHuber(PseudoHuber),
    Correlation(Correlation),
    SsaIndex(SsaIndex),
}

#[derive(Debug, Clone)]
pub enum Module {
    Split(Splitter),
    Filter(Filter),
    Gain(Gain),
    Nonlinearity(Nonlinearity),
    Metric(Metric),
}

impl Module {
    pub fn stage(&self) -> &dyn Stage {
        match self {
            Module::Split(s) => s,
            Module::Filter(Filter::WeightChannels(m)) => m,
            Module::Filter(Filter::Fir(m)) => m,
            Module::Gain(Gain::Dc(m)) => m,
            Module::Gain(Gain::Pupil(m)) => m,
            Module::Nonlinearity(Nonlinearity::DoubleExponential(m)) => m,
            Module::Metric(Metric::MeanSquareError(m)) => m,
            Module::Metric(Metric::PseudoHuber(m)) => m,
            Module::Metric(Metric::Correlation(m)) => m,
            Module::Metric(Metric::SsaIndex(m)) => m,
        }
    }

    pub fn stage_mut(&mut self) -> &mut dyn Stage {
        match self {
            Module::Split(s) => s,
            Module::Filter(Filter::WeightChannels(m)) => m,
            Module::Filter(Filter::Fir(m)) => m,
            Module::Gain(Gain::Dc(m)) => m,
            Module::Gain(Gain::Pupil(m)) => m,
            Module::Nonlinearity(Nonlinearity::DoubleExponential(m)) => m,
            Module::Metric(Metric::MeanSquareError(m)) => m,
            Module::Metric(Metric::PseudoHuber(m)) => m,
            Module::Metric(Metric::Correlation(m)) => m,
            Module::Metric(Metric::SsaIndex(m)) => m,
        }
    }

    pub fn name(&self) -> &'static str {
        self.stage().name()
    }

    pub fn is_metric(&self) -> bool {
        matches!(self, Module::Metric(_))
    }

    pub fn is_splitter(&self) -> bool {
        matches!(self, Module::Split(_))
    }

    pub fn evaluate(
        &mut self,
        input: &[DataContainer],
        state: &mut StackState,
    ) -> Result<Vec<DataContainer>, FitError> {
        self.stage_mut().evaluate(input, state)
    }

    pub fn initialize(&mut self, input: &[DataContainer], state: &mut StackState) -> Result<(), FitError> {
        self.stage_mut().initialize(input, state)
    }

    pub fn objective(&self) -> Option<f64> {
        self.stage().objective()
    }

    /// Number of values the fitter varies in this module.
    pub fn parameter_count(&self) -> usize {
        let stage = self.stage();
        stage
            .fit_fields()
            .iter()
            .map(|&p| stage.param(p).map_or(0, |v| v.len()))
            .sum()
    }

    /// Flat vector of all `fit_fields` values, in declaration order.
    pub fn fit_parameters(&self) -> Vec<f64> {
        let stage = self.stage();
        stage
            .fit_fields()
            .iter()
            .flat_map(|&p| stage.param(p).unwrap_or_default())
            .collect()
    }

    /// Write back a flat vector produced by [`Module::fit_parameters`].
    pub fn set_fit_parameters(&mut self, values: &[f64]) -> Result<(), FitError> {
        let expected = self.parameter_count();
        if values.len() != expected {
            return Err(FitError::Shape(format!(
                "{} expects {expected} fit parameters, got {}",
                self.name(),
                values.len()
            )));
        }
        let fields: Vec<Param> = self.stage().fit_fields().to_vec();
        let mut offset = 0;
        for p in fields {
            let len = self.stage().param(p).map_or(0, |v| v.len());
            self.stage_mut().set_param(p, &values[offset..offset + len])?;
            offset += len;
        }
        Ok(())
    }

    /// All parameter blocks with their names (fit or not), for reports and exports.
    pub fn parameters(&self) -> Vec<(&'static str, Vec<f64>)> {
        let stage = self.stage();
        [Param::Coefs, Param::Baseline, Param::Theta]
            .into_iter()
            .filter_map(|p| stage.param(p).map(|v| (p.as_str(), v)))
            .collect()
    }
}

/// Copy every input container and write `f(container)` into `output`.
pub(crate) fn transform(
    input: &[DataContainer],
    output: crate::domain::Field,
    mut f: impl FnMut(&DataContainer) -> Result<Array3<f64>, FitError>,
) -> Result<Vec<DataContainer>, FitError> {
    input
        .iter()
        .map(|d| {
            let value = f(d)?;
            let mut out = d.clone();
            out.set(output, value);
            Ok(out)
        })
        .collect()
}

/// Estimation containers (and unsplit ones, which are all estimation data).
pub(crate) fn is_estimation(c: &DataContainer) -> bool {
    c.is_estimation != Some(false)
}

/// Validation containers belonging to the active fold.
pub(crate) fn is_validation(c: &DataContainer, state: &StackState) -> bool {
    c.is_estimation == Some(false) && c.fold.is_none_or(|f| f == state.fold_index)
}

/// Check a parameter block length before storing it.
pub(crate) fn expect_len(module: &str, param: Param, values: &[f64], len: usize) -> Result<(), FitError> {
    if values.len() != len {
        return Err(FitError::Shape(format!(
            "{module}.{} expects {len} values, got {}",
            param.as_str(),
            values.len()
        )));
    }
    Ok(())
}
