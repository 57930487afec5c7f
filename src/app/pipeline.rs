//! Shared "fit one model" workflow.
//!
//! recording -> keyword stack -> fit -> result row -> optional export
//!
//! The queue bookkeeping around a run lives here too, so a job is marked
//! failed no matter which step of the fit went wrong.

use std::path::Path;

use crate::data::load_recording;
use crate::domain::FitConfig;
use crate::error::FitError;
use crate::fit::FitterOptions;
use crate::io::{JobQueue, JsonJobQueue, JsonResultStore, ResultRecord, ResultStore, write_fit_json};
use crate::models::{ModelFit, fit_model};
use crate::stack::StackState;

/// Result store and job queue used by a run.
///
/// Built once by the CLI and passed down explicitly.
pub struct FitContext {
    pub results: Box<dyn ResultStore>,
    pub queue: Box<dyn JobQueue>,
    /// Queue job this process runs on behalf of (`QUEUEID`).
    pub queue_id: Option<u64>,
}

impl FitContext {
    pub fn from_paths(results: &Path, queue: &Path, queue_id: Option<u64>) -> Self {
        Self {
            results: Box::new(JsonResultStore::new(results)),
            queue: Box::new(JsonJobQueue::new(queue)),
            queue_id,
        }
    }
}

/// All outputs of a single `neurofit fit` run.
#[derive(Debug)]
pub struct RunOutput {
    pub fit: ModelFit,
    pub record: ResultRecord,
}

/// Fit one model, reporting the outcome to the queue job if there is one.
pub fn run_fit(ctx: &mut FitContext, config: &FitConfig) -> Result<RunOutput, FitError> {
    let Some(id) = ctx.queue_id else {
        return fit_single_model(ctx, config);
    };

    ctx.queue.mark_running(id)?;
    match fit_single_model(ctx, config) {
        Ok(run) => {
            ctx.queue.mark_done(id)?;
            Ok(run)
        }
        Err(err) => {
            log::error!("{}: {err}", config.note());
            if let Err(mark) = ctx.queue.mark_failed(id) {
                log::warn!("Could not mark job {id} failed: {mark}");
            }
            Err(err)
        }
    }
}

/// Load the recording, fit, save the result row and write the export.
pub fn fit_single_model(ctx: &mut FitContext, config: &FitConfig) -> Result<RunOutput, FitError> {
    let data = load_recording(&config.recording_path())?;
    let state = StackState {
        valmode: config.valmode,
        seed: config.seed,
        ..StackState::default()
    };
    let opts = FitterOptions {
        tolerance: config.tolerance,
        max_iter: config.max_iter,
        ..FitterOptions::default()
    };

    log::info!("Fitting {}", config.note());
    let fit = fit_model(data, &config.modelname, state, &opts)?;
    log::info!(
        "Finished {}: r_est {:.4}, r_val {:.4}, mse_est {:.4}",
        config.note(),
        fit.meta("r_est"),
        fit.meta("r_val"),
        fit.meta("mse_est")
    );

    let figurefile = match &config.export {
        Some(path) => {
            write_fit_json(path, &fit, config)?;
            path.display().to_string()
        }
        None => String::new(),
    };

    let record = result_record(&fit, config, figurefile);
    ctx.results.save_result(record.clone())?;
    Ok(RunOutput { fit, record })
}

pub fn result_record(fit: &ModelFit, config: &FitConfig, figurefile: String) -> ResultRecord {
    ResultRecord {
        cellid: config.cellid.clone(),
        batch: config.batch,
        modelname: fit.modelname.clone(),
        r_est: fit.meta("r_est"),
        r_val: fit.meta("r_val"),
        r_floor: fit.meta("r_floor"),
        mse_est: fit.meta("mse_est"),
        mse_val: fit.meta("mse_val"),
        n_parms: fit.stack.parameter_count(),
        username: config.username.clone(),
        labgroup: config.labgroup.clone(),
        figurefile,
        lastmod: chrono::Local::now().naive_local(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SyntheticSpec, generate_recording, write_recording};
    use crate::io::JobStatus;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("neurofit-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn config(data_dir: PathBuf, modelname: &str) -> FitConfig {
        FitConfig {
            cellid: "syn001a-a1".to_string(),
            batch: 5,
            modelname: modelname.to_string(),
            data_dir,
            valmode: true,
            tolerance: 1e-4,
            max_iter: 100,
            seed: 0,
            export: None,
            username: "tester".to_string(),
            labgroup: "lab".to_string(),
        }
    }

    fn write_synthetic(config: &FitConfig) {
        let recording = generate_recording(&SyntheticSpec {
            stimuli: 8,
            time_bins: 30,
            ..SyntheticSpec::default()
        })
        .unwrap();
        write_recording(&config.recording_path(), &recording).unwrap();
    }

    #[test]
    fn queued_fit_is_saved_and_marked_done() {
        let dir = scratch("pipeline-done");
        let config = config(dir.join("data"), "stdval_fir03_dc_fit00");
        write_synthetic(&config);

        let mut queue = JsonJobQueue::new(dir.join("queue.json"));
        let id = queue.enqueue_job("neurofit", &config.note()).unwrap();
        let mut ctx = FitContext::from_paths(&dir.join("results.json"), &dir.join("queue.json"), Some(id));

        let run = run_fit(&mut ctx, &config).unwrap();
        assert_eq!(run.record.username, "tester");
        assert!(run.record.r_est.is_finite());
        assert!(ctx.results.find_existing_result("syn001a-a1", 5, "stdval_fir03_dc_fit00").unwrap());
        assert_eq!(ctx.queue.jobs().unwrap()[0].status, JobStatus::Done);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn failed_fit_marks_the_job_failed() {
        let dir = scratch("pipeline-failed");
        let config = config(dir.join("data"), "stdval_nonsense_fit00");
        write_synthetic(&config);

        let mut queue = JsonJobQueue::new(dir.join("queue.json"));
        let id = queue.enqueue_job("neurofit", &config.note()).unwrap();
        let mut ctx = FitContext::from_paths(&dir.join("results.json"), &dir.join("queue.json"), Some(id));

        let err = run_fit(&mut ctx, &config).unwrap_err();
        assert!(matches!(err, FitError::UnknownKeyword(_)));
        assert_eq!(ctx.queue.jobs().unwrap()[0].status, JobStatus::Failed);
        assert!(ctx.results.all_results().unwrap().is_empty());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_recording_is_an_io_error() {
        let dir = scratch("pipeline-missing");
        let config = config(dir.join("data"), "stdval_dc");
        let mut ctx = FitContext::from_paths(&dir.join("results.json"), &dir.join("queue.json"), None);
        assert!(matches!(run_fit(&mut ctx, &config), Err(FitError::Io { .. })));
    }
}
