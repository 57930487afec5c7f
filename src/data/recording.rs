//! Recording files.
//!
//! Recordings are exported from the acquisition system as JSON documents with
//! the same fields as the lab's MATLAB `data` struct (`stim`, `resp_raster`,
//! `stimfs`, `respfs`, `isolation`, `tags`, optional `pupil`). Nested arrays are
//! row-major: `stim[channel][trial][time]`, `resp_raster[trial][time]`.

use std::fs::File;
use std::path::Path;

use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::data::container::DataContainer;
use crate::domain::ResponseLayout;
use crate::error::FitError;

/// Trial timing tags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordingTags {
    #[serde(rename = "PreStimSilence", default)]
    pub pre_stim_silence: f64,
    #[serde(rename = "PostStimSilence", default)]
    pub post_stim_silence: f64,
    #[serde(rename = "Duration", default)]
    pub duration: f64,
}

/// On-disk recording schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingFile {
    pub cellid: String,
    pub stimfs: f64,
    pub respfs: f64,
    #[serde(default)]
    pub isolation: Option<f64>,
    #[serde(default)]
    pub tags: RecordingTags,
    pub stim: Vec<Vec<Vec<f64>>>,
    pub resp_raster: Vec<Vec<f64>>,
    #[serde(default)]
    pub pupil: Option<Vec<Vec<f64>>>,
    #[serde(default)]
    pub repcount: Option<Vec<usize>>,
    #[serde(default)]
    pub replist: Option<Vec<usize>>,
    #[serde(default = "default_layout")]
    pub layout: ResponseLayout,
}

fn default_layout() -> ResponseLayout {
    ResponseLayout::Averaged
}

impl RecordingFile {
    /// Convert into an unsplit data container.
    pub fn into_container(self) -> Result<DataContainer, FitError> {
        if (self.stimfs - self.respfs).abs() > f64::EPSILON {
            return Err(FitError::Configuration(format!(
                "{}: stimulus rate {} Hz differs from response rate {} Hz",
                self.cellid, self.stimfs, self.respfs
            )));
        }

        let stim = cube_from_nested(&self.stim, "stim")?;
        let resp = cube_from_rows(&self.resp_raster, "resp_raster")?;
        let pupil = match &self.pupil {
            Some(rows) => Some(cube_from_rows(rows, "pupil")?),
            None => {
                log::info!("{}: no pupil data in recording", self.cellid);
                None
            }
        };

        let rows = self.resp_raster.len();
        let (repetition_count, replist) = match self.layout {
            ResponseLayout::Averaged => (self.repcount.unwrap_or_else(|| vec![1; rows]), None),
            ResponseLayout::PerTrial => {
                let replist = self.replist.unwrap_or_else(|| (0..rows).collect());
                let repcount = match self.repcount {
                    Some(counts) => counts,
                    None => count_repetitions(&replist),
                };
                (repcount, Some(replist))
            }
        };

        DataContainer::new(stim, resp, pupil, repetition_count, replist, self.layout, self.respfs)
    }
}

/// Load a recording file and convert it into a data container.
pub fn load_recording(path: &Path) -> Result<DataContainer, FitError> {
    read_recording(path)?.into_container()
}

pub fn read_recording(path: &Path) -> Result<RecordingFile, FitError> {
    let file = File::open(path).map_err(|e| FitError::io(path, e))?;
    serde_json::from_reader(file).map_err(|e| FitError::json(path, e))
}

pub fn write_recording(path: &Path, recording: &RecordingFile) -> Result<(), FitError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| FitError::io(dir, e))?;
    }
    let file = File::create(path).map_err(|e| FitError::io(path, e))?;
    serde_json::to_writer(file, recording).map_err(|e| FitError::json(path, e))
}

fn count_repetitions(replist: &[usize]) -> Vec<usize> {
    let n = replist.iter().max().map_or(0, |m| m + 1);
    let mut counts = vec![0; n];
    for &s in replist {
        counts[s] += 1;
    }
    counts
}

fn cube_from_rows(rows: &[Vec<f64>], name: &str) -> Result<Array3<f64>, FitError> {
    let time = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|r| r.len() != time) {
        return Err(FitError::Shape(format!("{name}: rows have unequal lengths")));
    }
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    Array3::from_shape_vec((1, rows.len(), time), flat)
        .map_err(|e| FitError::Shape(format!("{name}: {e}")))
}

fn cube_from_nested(channels: &[Vec<Vec<f64>>], name: &str) -> Result<Array3<f64>, FitError> {
    let trials = channels.first().map_or(0, Vec::len);
    let time = channels
        .first()
        .and_then(|c| c.first())
        .map_or(0, Vec::len);
    let ragged = channels
        .iter()
        .any(|c| c.len() != trials || c.iter().any(|r| r.len() != time));
    if ragged {
        return Err(FitError::Shape(format!("{name}: channels or trials have unequal lengths")));
    }
    let flat: Vec<f64> = channels.iter().flatten().flatten().copied().collect();
    Array3::from_shape_vec((channels.len(), trials, time), flat)
        .map_err(|e| FitError::Shape(format!("{name}: {e}")))
}
