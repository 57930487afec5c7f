//! Fit job queue.
//!
//! Jobs are identified by a note (`cellid/batch/modelname`). A note can be
//! waiting or running at most once; finished jobs are re-armed in place so
//! their id stays stable across reruns.

use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::domain::{job_command, job_note};
use crate::error::FitError;
use crate::io::results::ResultStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    /// Waiting or running.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub command: String,
    pub note: String,
    pub status: JobStatus,
    pub added: NaiveDateTime,
    pub updated: NaiveDateTime,
}

pub trait JobQueue {
    /// Queue `command` under `note` and return the job id.
    ///
    /// Fails with [`FitError::DuplicateJob`] when a job with the same note is
    /// pending or running. A finished job with the same note is reset to
    /// pending and keeps its id.
    fn enqueue_job(&mut self, command: &str, note: &str) -> Result<u64, FitError>;

    fn set_status(&mut self, id: u64, status: JobStatus) -> Result<(), FitError>;

    fn jobs(&self) -> Result<Vec<Job>, FitError>;

    fn mark_running(&mut self, id: u64) -> Result<(), FitError> {
        self.set_status(id, JobStatus::Running)
    }

    fn mark_done(&mut self, id: u64) -> Result<(), FitError> {
        self.set_status(id, JobStatus::Done)
    }

    fn mark_failed(&mut self, id: u64) -> Result<(), FitError> {
        self.set_status(id, JobStatus::Failed)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueFile {
    next_id: u64,
    jobs: Vec<Job>,
}

#[derive(Debug, Clone)]
pub struct JsonJobQueue {
    path: PathBuf,
}

impl JsonJobQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<QueueFile, FitError> {
        match File::open(&self.path) {
            Ok(file) => serde_json::from_reader(file).map_err(|e| FitError::json(&self.path, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(QueueFile {
                next_id: 1,
                jobs: Vec::new(),
            }),
            Err(e) => Err(FitError::io(&self.path, e)),
        }
    }

    fn store(&self, queue: &QueueFile) -> Result<(), FitError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| FitError::io(dir, e))?;
        }
        let file = File::create(&self.path).map_err(|e| FitError::io(&self.path, e))?;
        serde_json::to_writer_pretty(file, queue).map_err(|e| FitError::json(&self.path, e))
    }
}

fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

impl JobQueue for JsonJobQueue {
    fn enqueue_job(&mut self, command: &str, note: &str) -> Result<u64, FitError> {
        let mut queue = self.load()?;
        if let Some(job) = queue.jobs.iter_mut().find(|j| j.note == note) {
            if job.status.is_active() {
                return Err(FitError::DuplicateJob {
                    note: note.to_string(),
                    id: job.id,
                });
            }
            log::info!("Resetting job {} ({note}) from {:?} to pending", job.id, job.status);
            job.status = JobStatus::Pending;
            job.command = command.to_string();
            job.updated = now();
            let id = job.id;
            self.store(&queue)?;
            return Ok(id);
        }

        let id = queue.next_id.max(1);
        queue.next_id = id + 1;
        let stamp = now();
        queue.jobs.push(Job {
            id,
            command: command.to_string(),
            note: note.to_string(),
            status: JobStatus::Pending,
            added: stamp,
            updated: stamp,
        });
        log::info!("Queued job {id}: {note}");
        self.store(&queue)?;
        Ok(id)
    }

    fn set_status(&mut self, id: u64, status: JobStatus) -> Result<(), FitError> {
        let mut queue = self.load()?;
        let job = queue
            .jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| FitError::Configuration(format!("no queue job with id {id}")))?;
        log::info!("Job {id} ({}): {:?} -> {status:?}", job.note, job.status);
        job.status = status;
        job.updated = now();
        self.store(&queue)
    }

    fn jobs(&self) -> Result<Vec<Job>, FitError> {
        Ok(self.load()?.jobs)
    }
}

/// What happened to each cell/model pair passed to [`enqueue_models`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EnqueueSummary {
    /// `(note, job id)` for every job added or re-armed.
    pub queued: Vec<(String, u64)>,
    /// Notes skipped because a result already exists.
    pub existing: Vec<String>,
    /// Notes skipped because a job is already pending or running.
    pub duplicates: Vec<String>,
}

/// Queue a fit for every combination of `cells` and `models`.
///
/// Pairs that already have a result in `store` are skipped unless
/// `force_rerun` is set. A pair whose job is still active is reported as a
/// duplicate rather than failing the whole batch.
pub fn enqueue_models(
    store: &dyn ResultStore,
    queue: &mut dyn JobQueue,
    cells: &[String],
    batch: u32,
    models: &[String],
    force_rerun: bool,
) -> Result<EnqueueSummary, FitError> {
    let mut summary = EnqueueSummary::default();
    for modelname in models {
        for cellid in cells {
            let note = job_note(cellid, batch, modelname);
            if !force_rerun && store.find_existing_result(cellid, batch, modelname)? {
                log::info!("Result exists for {note}, skipping");
                summary.existing.push(note);
                continue;
            }
            match queue.enqueue_job(&job_command(cellid, batch, modelname), &note) {
                Ok(id) => summary.queued.push((note, id)),
                Err(FitError::DuplicateJob { note, id }) => {
                    log::info!("{note} already queued as job {id}, skipping");
                    summary.duplicates.push(note);
                }
                Err(err) => return Err(err),
            }
        }
    }
    Ok(summary)
}
