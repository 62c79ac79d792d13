use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the avatar video daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root data directory; the other directories default to children of it
    pub data_dir: PathBuf,
    /// Avatar assets, one directory per avatar id
    pub avatars_dir: PathBuf,
    /// Temp root. Only files directly inside it are ever cleaned up automatically.
    pub temp_dir: PathBuf,
    /// Finished videos, keyed by job id
    pub output_dir: PathBuf,
    /// Directory where job state JSON files are stored
    pub job_state_dir: PathBuf,
    /// Directory scanned for job request files by the `run` loop
    pub inbox_dir: PathBuf,

    /// Output frame rate of generated videos
    pub video_fps: u32,
    /// Fixed avatar clip length in seconds; None = follow the speech duration
    pub reference_clip_secs: Option<f64>,
    pub video_codec: String,
    pub audio_codec: String,
    /// ffmpeg filter chain used for optional post-processing
    pub enhance_filter: String,

    /// Mono PCM sample rate speech is normalized to
    pub audio_sample_rate: u32,
    pub n_mels: usize,
    pub n_fft: usize,
    pub hop_length: usize,
    pub win_length: usize,
    pub f_min: f32,
    pub f_max: f32,
    /// Width (in feature rows) of the audio window fed per video frame
    pub mel_step_size: usize,

    /// Maximum number of faces per inference batch
    pub batch_size: usize,
    /// Square size of the face crop handed to the model
    pub model_input_size: u32,
    /// Extra margin around a detected face when cropping, relative to its longer side
    pub face_padding_ratio: f32,
    /// Faces smaller than this on either side are ignored
    pub min_face_size: u32,
    /// Upper bound on reference frames sampled when importing an avatar video
    pub avatar_max_frames: usize,

    /// Number of concurrent job workers
    pub max_workers: usize,
    /// Capacity of the pending job queue
    pub queue_max_size: usize,
    /// Wall-clock limit for a single job
    pub job_timeout_secs: u64,
    /// Delete temp artifacts once a job finishes
    pub auto_cleanup_temp: bool,
    /// Age after which leftover temp files are considered stale
    pub temp_file_max_age_secs: u64,
    /// Interval in seconds between inbox scans
    pub scan_interval_secs: u64,

    pub default_voice_id: String,
    pub voice_model: String,
    pub voice_stability: f32,
    pub voice_similarity_boost: f32,
    pub elevenlabs_api_key: Option<String>,
    pub elevenlabs_base_url: String,

    /// Path to ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to ffprobe binary
    pub ffprobe_bin: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl PipelineConfig {
    /// Create a default configuration rooted at `./data`
    pub fn default_config() -> Self {
        Self::with_data_dir(PathBuf::from("data"))
    }

    /// Default configuration with every directory placed under `data_dir`
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            avatars_dir: data_dir.join("avatars"),
            temp_dir: data_dir.join("temp"),
            output_dir: data_dir.join("output"),
            job_state_dir: data_dir.join("jobs"),
            inbox_dir: data_dir.join("inbox"),
            data_dir,
            video_fps: 25,
            reference_clip_secs: None,
            video_codec: "libx264".to_string(),
            audio_codec: "aac".to_string(),
            enhance_filter: "unsharp=5:5:0.8:3:3:0.4".to_string(),
            audio_sample_rate: 16_000,
            n_mels: 80,
            n_fft: 2048,
            hop_length: 640,
            win_length: 1600,
            f_min: 55.0,
            f_max: 7600.0,
            mel_step_size: 16,
            batch_size: 128,
            model_input_size: 96,
            face_padding_ratio: 0.2,
            min_face_size: 96,
            avatar_max_frames: 300,
            max_workers: 4,
            queue_max_size: 100,
            job_timeout_secs: 3600,
            auto_cleanup_temp: true,
            temp_file_max_age_secs: 3600,
            scan_interval_secs: 10,
            default_voice_id: "21m00Tcm4TlvDq8ikWAM".to_string(),
            voice_model: "eleven_monolingual_v1".to_string(),
            voice_stability: 0.5,
            voice_similarity_boost: 0.75,
            elevenlabs_api_key: None,
            elevenlabs_base_url: "https://api.elevenlabs.io".to_string(),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // JSON unless the file says TOML
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `AVATARD_DATA_DIR` and `ELEVENLABS_API_KEY` from the environment
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("AVATARD_DATA_DIR") {
            if !dir.is_empty() {
                let rebased = Self::with_data_dir(PathBuf::from(dir));
                self.avatars_dir = rebased.avatars_dir;
                self.temp_dir = rebased.temp_dir;
                self.output_dir = rebased.output_dir;
                self.job_state_dir = rebased.job_state_dir;
                self.inbox_dir = rebased.inbox_dir;
                self.data_dir = rebased.data_dir;
            }
        }
        if let Ok(key) = std::env::var("ELEVENLABS_API_KEY") {
            if !key.is_empty() {
                self.elevenlabs_api_key = Some(key);
            }
        }
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.video_fps == 0 {
            bail!("video_fps must be greater than zero");
        }
        if self.batch_size == 0 {
            bail!("batch_size must be greater than zero");
        }
        if self.mel_step_size == 0 {
            bail!("mel_step_size must be greater than zero");
        }
        if self.max_workers == 0 {
            bail!("max_workers must be greater than zero");
        }
        if self.queue_max_size == 0 {
            bail!("queue_max_size must be greater than zero");
        }
        for (name, value) in [
            ("audio_sample_rate", self.audio_sample_rate as usize),
            ("n_fft", self.n_fft),
            ("win_length", self.win_length),
            ("hop_length", self.hop_length),
            ("n_mels", self.n_mels),
        ] {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }
        if self.win_length > self.n_fft {
            bail!("win_length ({}) must not exceed n_fft ({})", self.win_length, self.n_fft);
        }
        if self.avatar_max_frames == 0 {
            bail!("avatar_max_frames must be greater than zero");
        }
        if self.model_input_size == 0 {
            bail!("model_input_size must be greater than zero");
        }
        if let Some(secs) = self.reference_clip_secs {
            if !(secs > 0.0) {
                bail!("reference_clip_secs must be positive when set");
            }
        }
        Ok(())
    }

    /// Create every directory the pipeline writes into
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.avatars_dir,
            &self.temp_dir,
            &self.output_dir,
            &self.job_state_dir,
            &self.inbox_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }
}
