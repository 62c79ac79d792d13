//! In-memory job registry.
//!
//! All access goes through one mutex, so a reader always sees a record as a
//! whole: status, progress, error and timestamps are changed together.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use log::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::job::{self, Job, JobStatus};

/// Which temp artifact a worker is recording on a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Audio,
    AvatarVideo,
}

#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, Job>>,
    state_dir: Option<PathBuf>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that also snapshots every terminal job into `state_dir`
    pub fn with_state_dir(state_dir: PathBuf) -> Self {
        JobRegistry {
            jobs: Mutex::new(HashMap::new()),
            state_dir: Some(state_dir),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        // A panicking writer never leaves a half-updated record behind, so the data stays usable
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new pending job and return its id
    pub fn submit(&self, job: Job) -> Result<String> {
        if job.status != JobStatus::Pending {
            return Err(PipelineError::Validation(format!(
                "job {} must be submitted as pending, not {}",
                job.id, job.status
            )));
        }
        let mut jobs = self.lock();
        if jobs.contains_key(&job.id) {
            return Err(PipelineError::Validation(format!("duplicate job id: {}", job.id)));
        }
        let id = job.id.clone();
        jobs.insert(id.clone(), job);
        debug!("Registered job {}", id);
        Ok(id)
    }

    /// Snapshot of one job
    pub fn get_status(&self, id: &str) -> Result<Job> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::job_not_found(id))
    }

    /// Jobs newest first, optionally filtered by status
    pub fn list(&self, filter: Option<JobStatus>, limit: usize) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .lock()
            .values()
            .filter(|j| filter.map_or(true, |status| j.status == status))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs.truncate(limit);
        jobs
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Flag a pending or running job as cancelled.
    ///
    /// In-flight work is not interrupted; the worker notices between stages.
    pub fn cancel(&self, id: &str) -> Result<Job> {
        let job = self.transition(id, JobStatus::Cancelled, |_| Ok(()))?;
        info!("Job {} cancelled", id);
        Ok(job)
    }

    /// Remove a job record, returning it so its artifacts can be cleaned up
    pub fn delete(&self, id: &str) -> Result<Job> {
        let job = self
            .lock()
            .remove(id)
            .ok_or_else(|| PipelineError::job_not_found(id))?;
        info!("Job {} deleted", id);
        Ok(job)
    }

    pub fn begin_processing(&self, id: &str) -> Result<Job> {
        self.transition(id, JobStatus::Processing, |_| Ok(()))
    }

    /// Move progress forward; going backwards is rejected
    pub fn record_progress(&self, id: &str, progress: u8) -> Result<Job> {
        let progress = progress.min(100);
        self.transition(id, JobStatus::Processing, |job| {
            if progress < job.progress {
                return Err(PipelineError::InvalidTransition {
                    id: job.id.clone(),
                    from: format!("progress {}", job.progress),
                    to: format!("progress {}", progress),
                });
            }
            job.progress = progress;
            Ok(())
        })
    }

    /// Remember a temp artifact so cleanup can find it later
    pub fn record_artifact(&self, id: &str, kind: Artifact, path: PathBuf) -> Result<()> {
        let mut jobs = self.lock();
        let job = jobs.get_mut(id).ok_or_else(|| PipelineError::job_not_found(id))?;
        match kind {
            Artifact::Audio => job.audio_path = Some(path),
            Artifact::AvatarVideo => job.avatar_video_path = Some(path),
        }
        job.updated_at = Utc::now();
        Ok(())
    }

    pub fn complete(&self, id: &str, output_path: PathBuf) -> Result<Job> {
        self.transition(id, JobStatus::Completed, |job| {
            job.progress = 100;
            job.output_path = Some(output_path);
            Ok(())
        })
    }

    pub fn fail(&self, id: &str, message: impl Into<String>) -> Result<Job> {
        let message = message.into();
        self.transition(id, JobStatus::Failed, |job| {
            job.error = Some(message);
            Ok(())
        })
    }

    /// True once a job has been flagged cancelled (or no longer exists)
    pub fn is_cancelled(&self, id: &str) -> bool {
        self.lock()
            .get(id)
            .map_or(true, |job| job.status == JobStatus::Cancelled)
    }

    /// Apply one validated change to a record under the lock
    fn transition<F>(&self, id: &str, next: JobStatus, update: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) -> Result<()>,
    {
        let snapshot = {
            let mut jobs = self.lock();
            let job = jobs.get_mut(id).ok_or_else(|| PipelineError::job_not_found(id))?;
            if !job.status.can_transition_to(next) {
                return Err(PipelineError::InvalidTransition {
                    id: id.to_string(),
                    from: job.status.to_string(),
                    to: next.to_string(),
                });
            }
            // Work on a copy so a rejected update leaves the record untouched
            let mut updated = job.clone();
            update(&mut updated)?;
            updated.status = next;
            updated.updated_at = Utc::now();
            *job = updated.clone();
            updated
        };

        if snapshot.status.is_terminal() {
            if let Some(dir) = &self.state_dir {
                if let Err(e) = job::save_job(&snapshot, dir) {
                    warn!("Failed to persist job {}: {}", snapshot.id, e);
                }
            }
        }
        Ok(snapshot)
    }
}
