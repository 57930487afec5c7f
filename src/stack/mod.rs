//! The model stack: an ordered list of modules and the cached output of each.
//!
//! Module `i` reads the output of module `i - 1` (module 0 reads the raw data).
//! `evaluate(start)` rebuilds every output from `start` onward, which is what
//! lets the fitter re-run only the suffix that depends on the parameters it is
//! varying.

use std::collections::BTreeMap;

use crate::data::DataContainer;
use crate::error::FitError;
use crate::modules::Module;

/// Named scalar results written by metric modules (`r_est`, `mse_val`, ...).
pub type Metadata = BTreeMap<String, f64>;

/// Settings and bookkeeping shared by all modules of a stack.
#[derive(Debug, Clone, Default)]
pub struct StackState {
    /// Produce and score validation containers.
    pub valmode: bool,
    /// Number of cross-validation folds; 0 until a cross-validation splitter sets it.
    pub fold_count: usize,
    /// Fold currently held out.
    pub fold_index: usize,
    pub meta: Metadata,
    /// Seed for every random draw made during evaluation.
    pub seed: u64,
}

impl StackState {
    pub fn with_valmode(valmode: bool) -> Self {
        Self {
            valmode,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Stack {
    pub data: Vec<DataContainer>,
    pub modules: Vec<Module>,
    outputs: Vec<Vec<DataContainer>>,
    pub state: StackState,
}

impl Stack {
    pub fn new(data: Vec<DataContainer>, state: StackState) -> Self {
        Self {
            data,
            modules: Vec::new(),
            outputs: Vec::new(),
            state,
        }
    }

    /// Input list of module `index`.
    pub fn input(&self, index: usize) -> &[DataContainer] {
        match index.checked_sub(1) {
            Some(prev) => self.outputs.get(prev).map_or(&[], Vec::as_slice),
            None => &self.data,
        }
    }

    /// Output of the last module (the raw data for an empty stack).
    pub fn output(&self) -> &[DataContainer] {
        self.input(self.modules.len())
    }

    pub fn output_of(&self, index: usize) -> &[DataContainer] {
        self.outputs.get(index).map_or(&[], Vec::as_slice)
    }

    /// Add a module, initialize it on the current output and evaluate it.
    ///
    /// On failure the module is removed again and the stack, including its
    /// state, is unchanged.
    pub fn append(&mut self, mut module: Module) -> Result<(), FitError> {
        let index = self.modules.len();
        let input = self.input(index).to_vec();
        let saved = self.state.clone();
        if let Err(err) = module.initialize(&input, &mut self.state) {
            self.state = saved;
            return Err(err);
        }
        self.modules.push(module);
        self.outputs.push(Vec::new());
        if let Err(err) = self.evaluate(index) {
            self.modules.pop();
            self.outputs.pop();
            self.state = saved;
            return Err(err);
        }
        log::debug!("appended {} at position {index}", self.modules[index].name());
        Ok(())
    }

    pub fn pop_module(&mut self) -> Option<Module> {
        self.outputs.pop();
        self.modules.pop()
    }

    /// Re-run modules `start..` in order, each building its output from scratch.
    pub fn evaluate(&mut self, start: usize) -> Result<(), FitError> {
        self.evaluate_range(start, self.modules.len())
    }

    /// Re-run modules `start..end` only.
    pub fn evaluate_range(&mut self, start: usize, end: usize) -> Result<(), FitError> {
        for index in start..end.min(self.modules.len()) {
            let input = match index.checked_sub(1) {
                Some(prev) => std::mem::take(&mut self.outputs[prev]),
                None => std::mem::take(&mut self.data),
            };
            let result = self.modules[index].evaluate(&input, &mut self.state);
            match index.checked_sub(1) {
                Some(prev) => self.outputs[prev] = input,
                None => self.data = input,
            }
            self.outputs[index] = result?;
        }
        Ok(())
    }

    /// Positions of modules whose name matches.
    pub fn find_modules(&self, name: &str) -> Vec<usize> {
        self.modules
            .iter()
            .enumerate()
            .filter(|(_, m)| m.name() == name)
            .map(|(i, _)| i)
            .collect()
    }

    /// Position of the metric the fitter minimizes: the first one in the stack.
    pub fn objective_index(&self) -> Option<usize> {
        self.modules.iter().position(Module::is_metric)
    }

    /// Overwrite one module's cached output (used to splice stitched
    /// cross-validation predictions in front of the metrics).
    pub fn replace_output(&mut self, index: usize, output: Vec<DataContainer>) -> Result<(), FitError> {
        let slot = self.outputs.get_mut(index).ok_or_else(|| {
            FitError::Configuration(format!("stack has no module at position {index}"))
        })?;
        *slot = output;
        Ok(())
    }

    /// Total number of values the fitter may vary.
    pub fn parameter_count(&self) -> usize {
        self.modules.iter().map(Module::parameter_count).sum()
    }

    /// Snapshot of every module's fit parameters.
    pub fn parameters(&self) -> Vec<Vec<f64>> {
        self.modules.iter().map(Module::fit_parameters).collect()
    }

    pub fn restore_parameters(&mut self, snapshot: &[Vec<f64>]) -> Result<(), FitError> {
        if snapshot.len() != self.modules.len() {
            return Err(FitError::Shape(format!(
                "parameter snapshot covers {} modules, stack has {}",
                snapshot.len(),
                self.modules.len()
            )));
        }
        for (module, values) in self.modules.iter_mut().zip(snapshot) {
            module.set_fit_parameters(values)?;
        }
        Ok(())
    }

    /// Model name-like summary, e.g. `split.standard > filters.fir > ...`.
    pub fn describe(&self) -> String {
        self.modules.iter().map(Module::name).collect::<Vec<_>>().join(" > ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::container::tests::averaged;
    use crate::modules::{DcGain, Filter, Fir, Gain, MeanSquareError, Metric, Splitter, WeightChannels};

    fn small_stack() -> Stack {
        let d = averaged(vec![1, 1, 2, 2, 5], 8, true);
        let mut stack = Stack::new(vec![d], StackState::with_valmode(true));
        stack.append(Module::Split(Splitter::Standard)).unwrap();
        stack
            .append(Module::Filter(Filter::WeightChannels(WeightChannels::new(1))))
            .unwrap();
        stack.append(Module::Filter(Filter::Fir(Fir::new(3)))).unwrap();
        stack.append(Module::Gain(Gain::Dc(DcGain::default()))).unwrap();
        stack
            .append(Module::Metric(Metric::MeanSquareError(MeanSquareError::default())))
            .unwrap();
        stack
    }

    #[test]
    fn append_evaluates_each_module() {
        let stack = small_stack();
        assert_eq!(stack.modules.len(), 5);
        assert_eq!(stack.output().len(), 2);
        assert!(stack.output()[0].pred.is_some());
        assert!(stack.state.meta.contains_key("mse_est"));
        assert_eq!(stack.find_modules("filters.fir"), vec![2]);
        assert_eq!(stack.objective_index(), Some(4));
    }

    #[test]
    fn reevaluation_is_bit_identical() {
        let mut stack = small_stack();
        stack.modules[2].set_fit_parameters(&[0.1, 0.2, 0.3, 0.4]).unwrap();
        stack.evaluate(1).unwrap();
        let first = stack.output().to_vec();
        let meta = stack.state.meta.clone();
        stack.evaluate(1).unwrap();
        assert_eq!(stack.output(), first.as_slice());
        assert_eq!(stack.state.meta, meta);
    }

    #[test]
    fn failed_append_leaves_stack_unchanged() {
        let d = averaged(vec![1, 2], 4, false);
        let mut stack = Stack::new(vec![d], StackState::default());
        // No `pred` yet, so the FIR input is missing.
        let err = stack.append(Module::Filter(Filter::Fir(Fir::new(2)))).unwrap_err();
        assert!(matches!(err, FitError::MissingField { .. }));
        assert!(stack.modules.is_empty());
        assert_eq!(stack.output().len(), 1);
    }

    #[test]
    fn parameters_round_trip_through_snapshot() {
        let mut stack = small_stack();
        let snapshot = stack.parameters();
        let mut moved = snapshot.clone();
        moved[3] = vec![1.0, 2.0];
        stack.restore_parameters(&moved).unwrap();
        assert_eq!(stack.parameters()[3], vec![1.0, 2.0]);
        stack.restore_parameters(&snapshot).unwrap();
        assert_eq!(stack.parameters(), snapshot);
        assert_eq!(stack.parameter_count(), 2 + 3 + 1 + 2);
    }

    #[test]
    fn failed_splitter_append_restores_fold_count() {
        let d = averaged(vec![1; 3], 4, false);
        let mut stack = Stack::new(vec![d], StackState::with_valmode(true));
        let err = stack
            .append(Module::Split(Splitter::cross_validation(0.1).unwrap()))
            .unwrap_err();
        assert!(matches!(err, FitError::Configuration(_)));
        assert!(stack.modules.is_empty());
        assert_eq!(stack.state.fold_count, 0);
        assert_eq!(stack.output().len(), 1);
    }
}
