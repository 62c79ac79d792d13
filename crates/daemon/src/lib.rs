pub mod error;
pub mod config;
pub mod job;
pub mod registry;
pub mod face;
pub mod audio;
pub mod align;
pub mod batch;
pub mod inference;
pub mod reconstruct;
pub mod ffprobe;
pub mod ffmpeg;
pub mod media;
pub mod tts;
pub mod avatar;
pub mod cleanup;
pub mod pipeline;
pub mod worker;
pub mod inbox;

#[cfg(test)]
mod testing;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use job::{Job, JobRequest, JobSettings, JobStatus, Stage};
pub use registry::JobRegistry;
pub use pipeline::Pipeline;
pub use worker::WorkerPool;
pub use ffprobe::{FFProbeData, FFProbeFormat, FFProbeStream};
