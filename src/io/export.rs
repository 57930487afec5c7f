//! JSON export of a fitted model.
//!
//! The export is meant to be easy to consume from downstream scripts: one
//! summary block with the run's metrics, then each module with its parameters.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::domain::FitConfig;
use crate::error::FitError;
use crate::models::ModelFit;

#[derive(Debug, Serialize)]
pub struct FitExport {
    pub cellid: String,
    pub batch: u32,
    pub modelname: String,
    pub created: NaiveDateTime,
    pub summary: FitSummary,
    pub modules: Vec<ModuleExport>,
}

#[derive(Debug, Serialize)]
pub struct FitSummary {
    pub fitter: Option<String>,
    pub cross_validated: bool,
    pub folds: usize,
    pub n_parms: usize,
    pub iterations: usize,
    pub converged: bool,
    /// Every metric written by the stack (`r_est`, `mse_val`, ...).
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Serialize)]
pub struct ModuleExport {
    pub name: String,
    pub parameters: BTreeMap<String, Vec<f64>>,
}

impl FitExport {
    pub fn new(fit: &ModelFit, config: &FitConfig) -> Self {
        let summary = FitSummary {
            fitter: fit.outcomes.first().map(|o| o.kind.display_name().to_string()),
            cross_validated: fit.cross_validated,
            folds: fit.outcomes.len(),
            n_parms: fit.stack.parameter_count(),
            iterations: fit.outcomes.iter().map(|o| o.iterations).sum(),
            converged: fit.outcomes.iter().all(|o| o.converged),
            // serde_json writes non-finite floats as null.
            metrics: fit.stack.state.meta.clone(),
        };
        let modules = fit
            .stack
            .modules
            .iter()
            .map(|m| ModuleExport {
                name: m.name().to_string(),
                parameters: m
                    .parameters()
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
            })
            .collect();
        Self {
            cellid: config.cellid.clone(),
            batch: config.batch,
            modelname: fit.modelname.clone(),
            created: chrono::Local::now().naive_local(),
            summary,
            modules,
        }
    }
}

/// Write `fit` as pretty-printed JSON.
pub fn write_fit_json(path: &Path, fit: &ModelFit, config: &FitConfig) -> Result<(), FitError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| FitError::io(dir, e))?;
    }
    let file = File::create(path).map_err(|e| FitError::io(path, e))?;
    serde_json::to_writer_pretty(file, &FitExport::new(fit, config)).map_err(|e| FitError::json(path, e))
}
