use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use tokio::process::Command;

use crate::config::PipelineConfig;

/// FFmpeg version information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FFmpegVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FFmpegVersion {
    /// rawvideo pipes and the aac encoder need 4.0 or later
    pub fn meets_requirement(&self) -> bool {
        self.major >= 4
    }

    /// Parse version from FFmpeg version string
    /// Example: "ffmpeg version 6.1.1" -> FFmpegVersion { major: 6, minor: 1, patch: 1 }
    pub fn parse(version_str: &str) -> Result<Self> {
        let version_part = version_str
            .split_whitespace()
            .find(|s| s.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))
            .ok_or_else(|| anyhow!("No version number found in: {}", version_str))?;

        // Distro builds append suffixes like "6.1.1-3ubuntu5"
        let numeric: String = version_part
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let mut parts = numeric.split('.').filter(|p| !p.is_empty());

        let major = parts
            .next()
            .ok_or_else(|| anyhow!("Invalid version format: {}", version_str))?
            .parse::<u32>()
            .with_context(|| format!("Failed to parse major version from: {}", version_part))?;
        let minor = parts.next().and_then(|p| p.parse::<u32>().ok()).unwrap_or(0);
        let patch = parts.next().and_then(|p| p.parse::<u32>().ok()).unwrap_or(0);

        Ok(FFmpegVersion { major, minor, patch })
    }
}

/// Result from FFmpeg execution
#[derive(Debug, Clone)]
pub struct FFmpegResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Located and version-checked ffmpeg/ffprobe binaries
#[derive(Debug, Clone)]
pub struct FFmpegManager {
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    pub version: FFmpegVersion,
}

impl FFmpegManager {
    pub async fn new(config: &PipelineConfig) -> Result<Self> {
        let ffmpeg_bin = config.ffmpeg_bin.clone();
        let ffprobe_bin = config.ffprobe_bin.clone();

        let version = Self::detect_version(&ffmpeg_bin).await?;
        if !version.meets_requirement() {
            return Err(anyhow!(
                "FFmpeg version {}.{}.{} does not meet requirement (>= 4.0). \
                 Please install FFmpeg 4.0 or later.",
                version.major,
                version.minor,
                version.patch
            ));
        }

        log::info!(
            "Using FFmpeg {}.{}.{} at {}",
            version.major,
            version.minor,
            version.patch,
            ffmpeg_bin.display()
        );

        Ok(FFmpegManager {
            ffmpeg_bin,
            ffprobe_bin,
            version,
        })
    }

    async fn detect_version(ffmpeg_bin: &Path) -> Result<FFmpegVersion> {
        let output = Command::new(ffmpeg_bin)
            .arg("-version")
            .output()
            .await
            .with_context(|| format!("Failed to execute FFmpeg at: {}", ffmpeg_bin.display()))?;

        if !output.status.success() {
            return Err(anyhow!("FFmpeg version check failed"));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout
            .lines()
            .next()
            .ok_or_else(|| anyhow!("Empty output from FFmpeg -version"))?;

        FFmpegVersion::parse(first_line)
    }

    /// Run ffmpeg to completion, killing it if `timeout_secs` elapses
    pub async fn execute_ffmpeg(&self, args: Vec<String>, timeout_secs: Option<u64>) -> Result<FFmpegResult> {
        let command_line = format!("{} {}", self.ffmpeg_bin.display(), args.join(" "));
        log::debug!("Running FFmpeg: {}", command_line);

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Could not start FFmpeg at {}", self.ffmpeg_bin.display()))?;

        let stdout = collect_lines(child.stdout.take());
        let stderr = collect_lines(child.stderr.take());

        let waited = match timeout_secs {
            Some(secs) => tokio::time::timeout(std::time::Duration::from_secs(secs), child.wait())
                .await
                .ok(),
            None => Some(child.wait().await),
        };
        let status = match waited {
            Some(status) => status.context("Lost track of the FFmpeg process")?,
            None => {
                child.kill().await.context("Could not kill overdue FFmpeg process")?;
                bail!("FFmpeg killed after exceeding {}s: {}", timeout_secs.unwrap_or_default(), command_line);
            }
        };

        let stdout = stdout.await.context("FFmpeg stdout reader failed")?;
        let stderr = stderr.await.context("FFmpeg stderr reader failed")?;
        if !status.success() {
            bail!(
                "FFmpeg exited with {}\nCommand: {}\nSTDERR:\n{}",
                status.code().map_or_else(|| "a signal".to_string(), |c| format!("code {}", c)),
                command_line,
                stderr
            );
        }

        Ok(FFmpegResult {
            exit_code: status.code(),
            stdout,
            stderr,
        })
    }
}

/// Read a child pipe to the end on a background task
fn collect_lines<R>(pipe: Option<R>) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    use tokio::io::{AsyncBufReadExt, BufReader};

    tokio::spawn(async move {
        let Some(pipe) = pipe else {
            return String::new();
        };
        let mut lines = BufReader::new(pipe).lines();
        let mut out = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            out.push(line);
        }
        out.join("\n")
    })
}

/// Command builder for generating FFmpeg command lines
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    pub video_codec: String,
    pub audio_codec: String,
}

impl CommandBuilder {
    pub fn new(video_codec: impl Into<String>, audio_codec: impl Into<String>) -> Self {
        CommandBuilder {
            video_codec: video_codec.into(),
            audio_codec: audio_codec.into(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.video_codec.clone(), config.audio_codec.clone())
    }

    /// Decode every frame of `input` as packed rgb24 on stdout
    pub fn build_decode_frames_command(&self, input: &Path) -> Vec<String> {
        vec![
            "-v".into(),
            "error".into(),
            "-i".into(),
            input.to_string_lossy().to_string(),
            "-map".into(),
            "0:v:0".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-".into(),
        ]
    }

    /// Encode rgb24 frames read from stdin into a silent video
    pub fn build_encode_frames_command(&self, width: u32, height: u32, fps: f64, output: &Path) -> Vec<String> {
        vec![
            "-y".into(),
            "-v".into(),
            "error".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-s".into(),
            format!("{}x{}", width, height),
            "-r".into(),
            fps.to_string(),
            "-i".into(),
            "-".into(),
            // yuv420p needs even dimensions
            "-vf".into(),
            "scale=trunc(iw/2)*2:trunc(ih/2)*2,format=yuv420p".into(),
            "-c:v".into(),
            self.video_codec.clone(),
            "-an".into(),
            output.to_string_lossy().to_string(),
        ]
    }

    /// Attach `audio` to `video` without re-encoding the picture.
    ///
    /// The video decides the length: short audio is padded with silence and
    /// everything past `video_secs` is dropped.
    pub fn build_mux_command(&self, video: &Path, audio: &Path, output: &Path, video_secs: f64) -> Vec<String> {
        vec![
            "-y".into(),
            "-i".into(),
            video.to_string_lossy().to_string(),
            "-i".into(),
            audio.to_string_lossy().to_string(),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "1:a:0".into(),
            "-c:v".into(),
            "copy".into(),
            "-c:a".into(),
            self.audio_codec.clone(),
            "-af".into(),
            "apad".into(),
            "-t".into(),
            format!("{:.3}", video_secs),
            output.to_string_lossy().to_string(),
        ]
    }

    /// Re-encode the video through `filter`, copying audio as-is
    pub fn build_enhance_command(&self, input: &Path, output: &Path, filter: &str) -> Vec<String> {
        vec![
            "-y".into(),
            "-i".into(),
            input.to_string_lossy().to_string(),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "0:a?".into(),
            "-vf".into(),
            filter.to_string(),
            "-c:v".into(),
            self.video_codec.clone(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-c:a".into(),
            "copy".into(),
            output.to_string_lossy().to_string(),
        ]
    }

    /// Convert any audio file to mono 16-bit PCM WAV at `sample_rate`
    pub fn build_transcode_audio_command(&self, input: &Path, output: &Path, sample_rate: u32) -> Vec<String> {
        vec![
            "-y".into(),
            "-i".into(),
            input.to_string_lossy().to_string(),
            "-vn".into(),
            "-ac".into(),
            "1".into(),
            "-ar".into(),
            sample_rate.to_string(),
            "-c:a".into(),
            "pcm_s16le".into(),
            output.to_string_lossy().to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arg_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_version_parsing() {
        let v = FFmpegVersion::parse("ffmpeg version 6.1.1-3ubuntu5 Copyright (c) 2000-2023").unwrap();
        assert_eq!(v, FFmpegVersion { major: 6, minor: 1, patch: 1 });
        assert!(v.meets_requirement());

        let v = FFmpegVersion::parse("ffmpeg version 3.4 Copyright").unwrap();
        assert!(!v.meets_requirement());

        assert!(FFmpegVersion::parse("ffmpeg version n/a").is_err());
    }

    #[test]
    fn test_mux_copies_video_and_encodes_audio() {
        let builder = CommandBuilder::new("libx264", "aac");
        let args = builder.build_mux_command(
            Path::new("/out/job_1_silent.mp4"),
            Path::new("/tmp/speech_job_1.wav"),
            Path::new("/out/job_1.mp4"),
            2.0,
        );
        assert_eq!(arg_after(&args, "-c:v"), Some("copy"));
        assert_eq!(arg_after(&args, "-c:a"), Some("aac"));
        assert_eq!(args.last().map(String::as_str), Some("/out/job_1.mp4"));
    }

    #[test]
    fn test_mux_length_follows_video() {
        let builder = CommandBuilder::new("libx264", "aac");
        // 100 frames at 25 fps against 2 s of speech
        let args = builder.build_mux_command(Path::new("v.mp4"), Path::new("a.wav"), Path::new("o.mp4"), 4.0);
        assert!(!args.iter().any(|a| a == "-shortest"));
        assert_eq!(arg_after(&args, "-af"), Some("apad"));
        assert_eq!(arg_after(&args, "-t"), Some("4.000"));
    }

    #[test]
    fn test_transcode_audio_is_mono_pcm() {
        let builder = CommandBuilder::new("libx264", "aac");
        let args = builder.build_transcode_audio_command(Path::new("in.mp3"), Path::new("out.wav"), 16_000);
        assert_eq!(arg_after(&args, "-ac"), Some("1"));
        assert_eq!(arg_after(&args, "-ar"), Some("16000"));
        assert_eq!(arg_after(&args, "-c:a"), Some("pcm_s16le"));
    }

    #[tokio::test]
    async fn test_execute_ffmpeg_version_check() {
        let config = PipelineConfig::default_config();
        let manager = match FFmpegManager::new(&config).await {
            Ok(m) => m,
            Err(_) => {
                println!("FFmpeg not available, skipping integration test");
                return;
            }
        };

        let output = manager
            .execute_ffmpeg(vec!["-version".to_string()], Some(5))
            .await
            .unwrap();
        assert!(output.stdout.contains("ffmpeg version"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        /// Encoding from a pipe always declares the raw frame geometry before the input
        #[test]
        fn test_encode_frames_declares_geometry(
            width in 2u32..4096,
            height in 2u32..4096,
            fps in prop::sample::select(vec![24.0f64, 25.0, 30.0, 29.97]),
        ) {
            let builder = CommandBuilder::new("libx264", "aac");
            let args = builder.build_encode_frames_command(width, height, fps, Path::new("o.mp4"));
            let size = format!("{}x{}", width, height);
            prop_assert_eq!(arg_after(&args, "-s"), Some(size.as_str()));
            prop_assert_eq!(arg_after(&args, "-pix_fmt"), Some("rgb24"));
            let input_pos = args.iter().position(|a| a == "-i").unwrap();
            let size_pos = args.iter().position(|a| a == "-s").unwrap();
            prop_assert!(size_pos < input_pos);
            prop_assert_eq!(arg_after(&args, "-c:v"), Some("libx264"));
        }
    }
}
