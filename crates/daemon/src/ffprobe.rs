use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tokio::process::Command;

use crate::media::VideoInfo;

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: FFProbeFormat,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: String,
    pub duration: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: i32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub avg_frame_rate: Option<String>,
    pub r_frame_rate: Option<String>,
    pub nb_frames: Option<String>,
    pub duration: Option<String>,
    pub sample_rate: Option<String>,
    pub channels: Option<i32>,
}

impl FFProbeData {
    pub fn video_stream(&self) -> Option<&FFProbeStream> {
        self.streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
    }

    pub fn audio_stream(&self) -> Option<&FFProbeStream> {
        self.streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("audio"))
    }

    /// Geometry, frame rate and frame count of the first video stream
    pub fn video_info(&self) -> Result<VideoInfo> {
        let stream = self
            .video_stream()
            .ok_or_else(|| anyhow!("No video stream found"))?;

        let width = stream.width.filter(|w| *w > 0).ok_or_else(|| anyhow!("Video stream has no width"))?;
        let height = stream.height.filter(|h| *h > 0).ok_or_else(|| anyhow!("Video stream has no height"))?;

        // avg_frame_rate is 0/0 for some containers, so fall back to r_frame_rate
        let fps = stream
            .avg_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
            .ok_or_else(|| anyhow!("Video stream has no usable frame rate"))?;

        let frame_count = match stream.nb_frames.as_deref().and_then(|n| n.parse::<usize>().ok()) {
            Some(n) => n,
            None => {
                let duration = stream
                    .duration
                    .as_deref()
                    .or(self.format.duration.as_deref())
                    .and_then(|d| d.parse::<f64>().ok())
                    .ok_or_else(|| anyhow!("Video stream has neither frame count nor duration"))?;
                (duration * fps).round() as usize
            }
        };

        Ok(VideoInfo {
            width: width as u32,
            height: height as u32,
            fps,
            frame_count,
        })
    }
}

/// Parse frame rate string (e.g., "30/1" or "29.97")
pub fn parse_frame_rate(frame_rate_str: &str) -> Option<f64> {
    // Try parsing as fraction (e.g., "30/1")
    if let Some((num_str, den_str)) = frame_rate_str.split_once('/') {
        if let (Ok(num), Ok(den)) = (num_str.parse::<f64>(), den_str.parse::<f64>()) {
            if den != 0.0 && num > 0.0 {
                return Some(num / den);
            }
        }
        return None;
    }

    // Try parsing as decimal (e.g., "29.97")
    frame_rate_str
        .parse::<f64>()
        .ok()
        .filter(|&f| f > 0.0 && f < 200.0) // Sanity check
}

/// Run ffprobe natively and parse the JSON output
pub async fn probe_file(ffprobe_bin: &Path, file_path: &Path) -> Result<FFProbeData> {
    use log::debug;

    if !file_path.exists() {
        anyhow::bail!("File does not exist: {}", file_path.display());
    }

    debug!("Executing ffprobe for: {}", file_path.display());

    let output = Command::new(ffprobe_bin)
        .arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_streams")
        .arg("-show_format")
        .arg(file_path)
        .output()
        .await
        .with_context(|| {
            format!(
                "Failed to execute ffprobe for: {}. Ensure ffprobe is installed and accessible at: {}",
                file_path.display(),
                ffprobe_bin.display()
            )
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);
        anyhow::bail!(
            "ffprobe failed (exit code {}) for {}:\nSTDERR: {}",
            exit_code,
            file_path.display(),
            stderr
        );
    }

    let json_str = String::from_utf8(output.stdout).context("ffprobe output is not valid UTF-8")?;
    let data: FFProbeData = serde_json::from_str(&json_str)
        .with_context(|| format!("Failed to parse ffprobe JSON for: {}", file_path.display()))?;

    Ok(data)
}
