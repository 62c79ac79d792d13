use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::face::FaceRegion;

/// Lifecycle of a generation job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Transition table.
    ///
    /// Processing -> Processing is the progress update of a running job.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Processing) | (Pending, Cancelled) | (Pending, Failed) => true,
            (Processing, Processing)
            | (Processing, Completed)
            | (Processing, Failed)
            | (Processing, Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(PipelineError::Validation(format!("unknown job status: {}", other))),
        }
    }
}

/// Pipeline stages with the progress checkpoint reached when each one succeeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    SynthesizeAudio,
    ResolveAvatar,
    LipSync,
    PostProcess,
    Finalize,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::SynthesizeAudio,
        Stage::ResolveAvatar,
        Stage::LipSync,
        Stage::PostProcess,
        Stage::Finalize,
    ];

    pub fn checkpoint(&self) -> u8 {
        match self {
            Stage::SynthesizeAudio => 20,
            Stage::ResolveAvatar => 40,
            Stage::LipSync => 80,
            Stage::PostProcess => 90,
            Stage::Finalize => 100,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::SynthesizeAudio => "synthesize audio",
            Stage::ResolveAvatar => "resolve avatar",
            Stage::LipSync => "lip sync",
            Stage::PostProcess => "post-process",
            Stage::Finalize => "finalize",
        }
    }
}

/// Per-job knobs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    /// Run the post-processing stage
    pub enhance_quality: bool,
    /// Known face location, overriding the avatar's stored one
    pub face_region: Option<FaceRegion>,
    /// Where the final video should be written; defaults to `<output_dir>/<job_id>.mp4`
    pub output_path: Option<PathBuf>,
}

/// What a caller submits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub script: String,
    pub avatar_id: String,
    #[serde(default)]
    pub voice_id: Option<String>,
    #[serde(default)]
    pub settings: JobSettings,
}

impl JobRequest {
    pub fn new(script: impl Into<String>, avatar_id: impl Into<String>) -> Self {
        JobRequest {
            script: script.into(),
            avatar_id: avatar_id.into(),
            voice_id: None,
            settings: JobSettings::default(),
        }
    }

    /// Reject malformed requests before anything is queued
    pub fn validate(&self) -> Result<()> {
        if self.script.trim().is_empty() {
            return Err(PipelineError::Validation("script is empty".to_string()));
        }
        validate_identifier("avatar id", &self.avatar_id)?;
        if let Some(voice) = &self.voice_id {
            validate_identifier("voice id", voice)?;
        }
        Ok(())
    }
}

/// Ids end up in file names, so only `[A-Za-z0-9_-]{1,64}` is accepted
pub fn validate_identifier(what: &str, value: &str) -> Result<()> {
    let well_formed = !value.is_empty()
        && value.len() <= 64
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if well_formed {
        Ok(())
    } else {
        Err(PipelineError::Validation(format!("malformed {}: {:?}", what, value)))
    }
}

/// One video-generation request and its lifecycle record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub script: String,
    pub avatar_id: String,
    pub voice_id: Option<String>,
    #[serde(default)]
    pub settings: JobSettings,
    /// 0-100, never decreases while the job is running
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Final video, set once completed
    pub output_path: Option<PathBuf>,
    /// Failure message, set once failed
    pub error: Option<String>,
    /// Synthesized speech (temp artifact)
    pub audio_path: Option<PathBuf>,
    /// Constructed reference clip (temp artifact)
    pub avatar_video_path: Option<PathBuf>,
}

impl Job {
    pub fn new(request: JobRequest) -> Self {
        let now = Utc::now();
        Job {
            id: generate_job_id(),
            status: JobStatus::Pending,
            script: request.script,
            avatar_id: request.avatar_id,
            voice_id: request.voice_id,
            settings: request.settings,
            progress: 0,
            created_at: now,
            updated_at: now,
            output_path: None,
            error: None,
            audio_path: None,
            avatar_video_path: None,
        }
    }

    /// Paths of the temp artifacts this job produced
    pub fn temp_artifacts(&self) -> Vec<&Path> {
        [self.audio_path.as_deref(), self.avatar_video_path.as_deref()]
            .into_iter()
            .flatten()
            .collect()
    }
}

/// `job_` followed by 12 hex characters
pub fn generate_job_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("job_{}", &hex[..12])
}

/// Path of the state file for a job id
pub fn job_state_path(id: &str, job_state_dir: &Path) -> PathBuf {
    job_state_dir.join(format!("{}.json", id))
}

/// Write a job snapshot to `<dir>/<id>.json`, replacing the previous one atomically
pub fn save_job(job: &Job, job_state_dir: &Path) -> Result<()> {
    fs::create_dir_all(job_state_dir)?;
    let path = job_state_path(&job.id, job_state_dir);
    let tmp = path.with_extension("json.tmp");
    let content = serde_json::to_string_pretty(job)?;
    fs::write(&tmp, content)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Load every job snapshot in `dir`, skipping files that fail to parse
pub fn load_all_jobs(job_state_dir: &Path) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    if !job_state_dir.exists() {
        return Ok(jobs);
    }

    for entry in fs::read_dir(job_state_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        let parsed = fs::read_to_string(&path)
            .map_err(PipelineError::from)
            .and_then(|content| serde_json::from_str::<Job>(&content).map_err(PipelineError::from));
        match parsed {
            Ok(job) => jobs.push(job),
            Err(e) => warn!("Skipping unreadable job file {}: {}", path.display(), e),
        }
    }

    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Processing, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next), "{} -> {}", terminal, next);
            }
        }
    }

    #[test]
    fn test_checkpoints_strictly_increase() {
        let checkpoints: Vec<u8> = Stage::ALL.iter().map(|s| s.checkpoint()).collect();
        assert_eq!(checkpoints, vec![20, 40, 80, 90, 100]);
    }

    #[test]
    fn test_job_id_format() {
        let id = generate_job_id();
        assert!(id.starts_with("job_"));
        assert_eq!(id.len(), 16);
        assert_ne!(id, generate_job_id());
    }

    #[test]
    fn test_request_validation() {
        assert!(JobRequest::new("Hello there", "avatar_01").validate().is_ok());
        assert!(JobRequest::new("   ", "avatar_01").validate().is_err());
        assert!(JobRequest::new("Hello", "../etc").validate().is_err());

        let mut req = JobRequest::new("Hello", "avatar_01");
        req.voice_id = Some("voice id with spaces".to_string());
        assert!(matches!(req.validate(), Err(PipelineError::Validation(_))));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&JobStatus::Cancelled).unwrap(), "\"cancelled\"");
        assert_eq!("Processing".parse::<JobStatus>().unwrap(), JobStatus::Processing);
    }

    #[test]
    fn test_save_and_load_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let job = Job::new(JobRequest::new("Hi", "avatar_01"));
        save_job(&job, dir.path()).unwrap();
        std::fs::write(dir.path().join("garbage.json"), "{not json").unwrap();

        let loaded = load_all_jobs(dir.path()).unwrap();
        assert_eq!(loaded, vec![job]);
    }
}
