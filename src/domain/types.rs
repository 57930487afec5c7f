//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - used in-memory while a stack is evaluated
//! - written into recording files, result stores and fit exports
//! - parsed from CLI flags

use std::path::PathBuf;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// A signal stored in a data container.
///
/// Every signal is a `(channel, trial, time)` cube. Only `Stim` is expected to
/// carry more than one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Stim,
    Resp,
    Pupil,
    Pred,
}

impl Field {
    pub fn as_str(self) -> &'static str {
        match self {
            Field::Stim => "stim",
            Field::Resp => "resp",
            Field::Pupil => "pupil",
            Field::Pred => "pred",
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How response rows relate to stimuli.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseLayout {
    /// One row per distinct stimulus (PSTH averaged over repetitions).
    /// `repetition_count[i]` belongs to row `i`.
    Averaged,
    /// One row per presentation. `replist[row]` names the stimulus, and
    /// `repetition_count` is indexed by stimulus.
    PerTrial,
}

/// Local optimizer used by the fitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum FitterKind {
    /// Derivative-free downhill simplex.
    NelderMead,
    /// One parameter at a time, halving the step when a sweep stalls.
    CoordinateDescent,
}

impl FitterKind {
    pub fn display_name(self) -> &'static str {
        match self {
            FitterKind::NelderMead => "Nelder-Mead",
            FitterKind::CoordinateDescent => "coordinate descent",
        }
    }
}

/// A single fit job's configuration as understood by the pipeline.
///
/// This is derived from CLI flags plus environment defaults.
#[derive(Debug, Clone)]
pub struct FitConfig {
    pub cellid: String,
    pub batch: u32,
    pub modelname: String,

    /// Root directory holding `<batch>/<cellid>.json` recordings.
    pub data_dir: PathBuf,

    /// Compute validation predictions and metrics in addition to estimation.
    pub valmode: bool,

    /// Stop when the objective changes by less than this between iterations.
    pub tolerance: f64,
    pub max_iter: usize,

    /// Seed for every random draw made while evaluating the stack.
    pub seed: u64,

    /// Optional JSON export of the fitted stack.
    pub export: Option<PathBuf>,

    /// Provenance columns written with the result row.
    pub username: String,
    pub labgroup: String,
}

impl FitConfig {
    /// Default location of a recording for this cell and batch.
    pub fn recording_path(&self) -> PathBuf {
        self.data_dir
            .join(self.batch.to_string())
            .join(format!("{}.json", self.cellid))
    }

    /// Queue note identifying this job (`cellid/batch/modelname`).
    pub fn note(&self) -> String {
        job_note(&self.cellid, self.batch, &self.modelname)
    }
}

/// Queue note for a cell/batch/model triple.
pub fn job_note(cellid: &str, batch: u32, modelname: &str) -> String {
    format!("{cellid}/{batch}/{modelname}")
}

/// Command line that runs a single fit job.
pub fn job_command(cellid: &str, batch: u32, modelname: &str) -> String {
    format!("neurofit {cellid} {batch} {modelname}")
}
