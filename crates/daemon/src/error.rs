use thiserror::Error;

/// Errors surfaced by the avatar video pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Unknown avatar or voice reference, or a malformed request
    #[error("validation error: {0}")]
    Validation(String),

    /// TTS or inference call failed. Never retried automatically.
    #[error("{service} error: {message}")]
    ExternalService {
        service: &'static str,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("job {id}: invalid transition from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("job queue is full (capacity {0})")]
    QueueFull(usize),

    #[error("job {0} was cancelled")]
    Cancelled(String),

    #[error("job timed out after {0} seconds")]
    TimedOut(u64),

    #[error("media processing failed: {0:#}")]
    Media(#[from] anyhow::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn job_not_found(id: impl Into<String>) -> Self {
        PipelineError::NotFound {
            kind: "job",
            id: id.into(),
        }
    }

    pub fn avatar_not_found(id: impl Into<String>) -> Self {
        PipelineError::NotFound {
            kind: "avatar",
            id: id.into(),
        }
    }

    pub fn external(service: &'static str, message: impl Into<String>) -> Self {
        PipelineError::ExternalService {
            service,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PipelineError::NotFound { .. })
    }

    /// Message safe to hand to a status consumer.
    ///
    /// Not-found maps to a not-found response; anything else only exposes the
    /// job's stored error message (if any), never internal detail.
    pub fn public_message(&self, stored_error: Option<&str>) -> String {
        match self {
            PipelineError::NotFound { kind, id } => format!("{} not found: {}", kind, id),
            _ => stored_error
                .map(str::to_string)
                .unwrap_or_else(|| "job processing failed".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_message_hides_internal_detail() {
        let err = PipelineError::Media(anyhow::anyhow!("ffmpeg exited 1\nSTDERR: /srv/secret/path"));
        assert_eq!(err.public_message(Some("lip sync failed")), "lip sync failed");
        assert_eq!(err.public_message(None), "job processing failed");
    }

    #[test]
    fn test_public_message_for_not_found() {
        let err = PipelineError::job_not_found("job_abc");
        assert!(err.is_not_found());
        assert_eq!(err.public_message(Some("ignored")), "job not found: job_abc");
    }
}
