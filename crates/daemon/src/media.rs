//! Video and audio I/O seam.
//!
//! The pipeline only talks to [`MediaBackend`]. [`FfmpegBackend`] shells out to
//! ffmpeg/ffprobe; [`MemoryBackend`] keeps frames in memory for dry runs and tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use image::RgbImage;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::config::PipelineConfig;
use crate::ffmpeg::{CommandBuilder, FFmpegManager};
use crate::ffprobe;

/// Basic geometry and timing of a video stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_count: usize,
}

/// Sequential frame reader
#[async_trait]
pub trait FrameSource: Send {
    /// None once the stream is exhausted
    async fn next_frame(&mut self) -> Result<Option<RgbImage>>;
}

/// Append-only frame writer, owned by a single task
#[async_trait]
pub trait FrameSink: Send {
    async fn write_frame(&mut self, frame: &RgbImage) -> Result<()>;

    /// Flush and close the output, returning how many frames were written
    async fn finish(&mut self) -> Result<usize>;
}

#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn probe_video(&self, path: &Path) -> Result<VideoInfo>;

    async fn open_video(&self, path: &Path) -> Result<(VideoInfo, Box<dyn FrameSource>)>;

    async fn create_video(&self, path: &Path, width: u32, height: u32, fps: f64) -> Result<Box<dyn FrameSink>>;

    /// Convert any audio file to mono PCM WAV at `sample_rate`
    async fn transcode_audio(&self, input: &Path, output: &Path, sample_rate: u32) -> Result<()>;

    /// Combine a silent video with an audio track
    async fn mux_audio(&self, video: &Path, audio: &Path, output: &Path) -> Result<()>;

    /// Optional quality pass
    async fn enhance(&self, input: &Path, output: &Path) -> Result<()>;
}

/// ffmpeg/ffprobe subprocess backend
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    manager: Arc<FFmpegManager>,
    commands: CommandBuilder,
    enhance_filter: String,
    /// Per-command wall-clock limit for one-shot ffmpeg runs
    timeout_secs: Option<u64>,
}

impl FfmpegBackend {
    pub async fn new(config: &PipelineConfig) -> Result<Self> {
        let manager = FFmpegManager::new(config).await?;
        Ok(FfmpegBackend {
            manager: Arc::new(manager),
            commands: CommandBuilder::from_config(config),
            enhance_filter: config.enhance_filter.clone(),
            timeout_secs: Some(config.job_timeout_secs),
        })
    }

    fn spawn(&self, args: Vec<String>, stdin: Stdio, stdout: Stdio) -> Result<Child> {
        debug!("Spawning FFmpeg: {} {}", self.manager.ffmpeg_bin.display(), args.join(" "));
        Command::new(&self.manager.ffmpeg_bin)
            .args(&args)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn FFmpeg at: {}", self.manager.ffmpeg_bin.display()))
    }
}

/// Collect a child's stderr in the background so the pipe never fills up
fn drain_stderr(child: &mut Child) -> Option<JoinHandle<String>> {
    let mut stderr = child.stderr.take()?;
    Some(tokio::spawn(async move {
        let mut buf = String::new();
        let _ = stderr.read_to_string(&mut buf).await;
        buf
    }))
}

async fn collect_stderr(handle: Option<JoinHandle<String>>) -> String {
    match handle {
        Some(h) => h.await.unwrap_or_default(),
        None => String::new(),
    }
}

#[async_trait]
impl MediaBackend for FfmpegBackend {
    async fn probe_video(&self, path: &Path) -> Result<VideoInfo> {
        let data = ffprobe::probe_file(&self.manager.ffprobe_bin, path).await?;
        data.video_info()
            .with_context(|| format!("Unusable video stream in {}", path.display()))
    }

    async fn open_video(&self, path: &Path) -> Result<(VideoInfo, Box<dyn FrameSource>)> {
        let info = self.probe_video(path).await?;
        let mut child = self.spawn(
            self.commands.build_decode_frames_command(path),
            Stdio::null(),
            Stdio::piped(),
        )?;
        let stderr = drain_stderr(&mut child);
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to capture FFmpeg stdout"))?;

        let source = FfmpegFrameSource {
            child,
            stdout,
            stderr,
            width: info.width,
            height: info.height,
            frame_bytes: info.width as usize * info.height as usize * 3,
        };
        Ok((info, Box::new(source)))
    }

    async fn create_video(&self, path: &Path, width: u32, height: u32, fps: f64) -> Result<Box<dyn FrameSink>> {
        let mut child = self.spawn(
            self.commands.build_encode_frames_command(width, height, fps, path),
            Stdio::piped(),
            Stdio::null(),
        )?;
        let stderr = drain_stderr(&mut child);
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Failed to capture FFmpeg stdin"))?;

        Ok(Box::new(FfmpegFrameSink {
            child,
            stdin: Some(stdin),
            stderr,
            width,
            height,
            written: 0,
            path: path.to_path_buf(),
        }))
    }

    async fn transcode_audio(&self, input: &Path, output: &Path, sample_rate: u32) -> Result<()> {
        let args = self.commands.build_transcode_audio_command(input, output, sample_rate);
        self.manager.execute_ffmpeg(args, self.timeout_secs).await?;
        Ok(())
    }

    async fn mux_audio(&self, video: &Path, audio: &Path, output: &Path) -> Result<()> {
        let info = self.probe_video(video).await?;
        let video_secs = if info.fps > 0.0 {
            info.frame_count as f64 / info.fps
        } else {
            bail!("Cannot mux {}: frame rate is zero", video.display());
        };
        let args = self.commands.build_mux_command(video, audio, output, video_secs);
        self.manager.execute_ffmpeg(args, self.timeout_secs).await?;
        Ok(())
    }

    async fn enhance(&self, input: &Path, output: &Path) -> Result<()> {
        let args = self.commands.build_enhance_command(input, output, &self.enhance_filter);
        self.manager.execute_ffmpeg(args, self.timeout_secs).await?;
        Ok(())
    }
}

/// Reads rgb24 frames from an ffmpeg decoder's stdout
struct FfmpegFrameSource {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    width: u32,
    height: u32,
    frame_bytes: usize,
}

#[async_trait]
impl FrameSource for FfmpegFrameSource {
    async fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        let mut buf = vec![0u8; self.frame_bytes];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .stdout
                .read(&mut buf[filled..])
                .await
                .context("Failed to read decoded frame")?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            let status = self.child.wait().await.context("Failed to wait for FFmpeg decoder")?;
            if !status.success() {
                let stderr = collect_stderr(self.stderr.take()).await;
                bail!(
                    "FFmpeg decoder failed (exit code: {})\nSTDERR:\n{}",
                    status.code().unwrap_or(-1),
                    stderr
                );
            }
            return Ok(None);
        }
        if filled < buf.len() {
            bail!("Truncated frame from decoder: {} of {} bytes", filled, buf.len());
        }

        RgbImage::from_raw(self.width, self.height, buf)
            .map(Some)
            .ok_or_else(|| anyhow!("Decoded frame does not match {}x{}", self.width, self.height))
    }
}

/// Feeds rgb24 frames into an ffmpeg encoder's stdin
struct FfmpegFrameSink {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr: Option<JoinHandle<String>>,
    width: u32,
    height: u32,
    written: usize,
    path: PathBuf,
}

#[async_trait]
impl FrameSink for FfmpegFrameSink {
    async fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        if frame.dimensions() != (self.width, self.height) {
            bail!(
                "Frame {} is {}x{}, expected {}x{}",
                self.written,
                frame.width(),
                frame.height(),
                self.width,
                self.height
            );
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("Video writer for {} is already finished", self.path.display()))?;
        stdin
            .write_all(frame.as_raw())
            .await
            .with_context(|| format!("Failed to write frame {} to encoder", self.written))?;
        self.written += 1;
        Ok(())
    }

    async fn finish(&mut self) -> Result<usize> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.shutdown().await.context("Failed to close encoder input")?;
        }
        let status = self.child.wait().await.context("Failed to wait for FFmpeg encoder")?;
        if !status.success() {
            let stderr = collect_stderr(self.stderr.take()).await;
            bail!(
                "FFmpeg encoder failed for {} (exit code: {})\nSTDERR:\n{}",
                self.path.display(),
                status.code().unwrap_or(-1),
                stderr
            );
        }
        Ok(self.written)
    }
}

/// Frames served from memory
#[derive(Debug, Default)]
pub struct VecFrameSource {
    frames: VecDeque<RgbImage>,
}

impl VecFrameSource {
    pub fn new(frames: Vec<RgbImage>) -> Self {
        VecFrameSource { frames: frames.into() }
    }
}

#[async_trait]
impl FrameSource for VecFrameSource {
    async fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        Ok(self.frames.pop_front())
    }
}

type VideoStore = Arc<Mutex<HashMap<PathBuf, StoredVideo>>>;

#[derive(Debug, Clone)]
struct StoredVideo {
    fps: f64,
    frames: Vec<RgbImage>,
}

/// Collects frames in memory and publishes them to a [`MemoryBackend`] on finish
pub struct MemorySink {
    path: PathBuf,
    fps: f64,
    frames: Vec<RgbImage>,
    store: VideoStore,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        self.frames.push(frame.clone());
        Ok(())
    }

    async fn finish(&mut self) -> Result<usize> {
        let frames = std::mem::take(&mut self.frames);
        let count = frames.len();
        // A small marker file makes the video visible to path-based cleanup
        tokio::fs::write(&self.path, format!("memory video: {} frames\n", count))
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        lock_store(&self.store).insert(
            self.path.clone(),
            StoredVideo {
                fps: self.fps,
                frames,
            },
        );
        Ok(count)
    }
}

fn lock_store(store: &VideoStore) -> std::sync::MutexGuard<'_, HashMap<PathBuf, StoredVideo>> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process backend: videos are frame vectors keyed by path
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    videos: VideoStore,
    /// When set, `mux_audio` leaves a truncated file and fails with this message
    mux_error: Option<String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend whose muxer always fails
    pub fn with_failing_mux(message: impl Into<String>) -> Self {
        MemoryBackend {
            videos: VideoStore::default(),
            mux_error: Some(message.into()),
        }
    }

    /// Frames stored at `path`, if a video was written there
    pub fn frames(&self, path: &Path) -> Option<Vec<RgbImage>> {
        lock_store(&self.videos).get(path).map(|v| v.frames.clone())
    }

    pub fn insert_video(&self, path: &Path, fps: f64, frames: Vec<RgbImage>) {
        lock_store(&self.videos).insert(path.to_path_buf(), StoredVideo { fps, frames });
    }

    fn stored(&self, path: &Path) -> Result<StoredVideo> {
        lock_store(&self.videos)
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("No video at {}", path.display()))
    }

    async fn copy_video(&self, input: &Path, output: &Path) -> Result<()> {
        let video = self.stored(input)?;
        tokio::fs::write(output, format!("memory video: {} frames\n", video.frames.len()))
            .await
            .with_context(|| format!("Failed to write {}", output.display()))?;
        lock_store(&self.videos).insert(output.to_path_buf(), video);
        Ok(())
    }
}

#[async_trait]
impl MediaBackend for MemoryBackend {
    async fn probe_video(&self, path: &Path) -> Result<VideoInfo> {
        let video = self.stored(path)?;
        let (width, height) = video.frames.first().map(|f| f.dimensions()).unwrap_or((0, 0));
        Ok(VideoInfo {
            width,
            height,
            fps: video.fps,
            frame_count: video.frames.len(),
        })
    }

    async fn open_video(&self, path: &Path) -> Result<(VideoInfo, Box<dyn FrameSource>)> {
        let info = self.probe_video(path).await?;
        let video = self.stored(path)?;
        Ok((info, Box::new(VecFrameSource::new(video.frames))))
    }

    async fn create_video(&self, path: &Path, _width: u32, _height: u32, fps: f64) -> Result<Box<dyn FrameSink>> {
        Ok(Box::new(MemorySink {
            path: path.to_path_buf(),
            fps,
            frames: Vec::new(),
            store: Arc::clone(&self.videos),
        }))
    }

    async fn transcode_audio(&self, input: &Path, output: &Path, _sample_rate: u32) -> Result<()> {
        tokio::fs::copy(input, output)
            .await
            .with_context(|| format!("Failed to copy {} to {}", input.display(), output.display()))?;
        Ok(())
    }

    async fn mux_audio(&self, video: &Path, audio: &Path, output: &Path) -> Result<()> {
        if let Some(message) = &self.mux_error {
            tokio::fs::write(output, b"truncated")
                .await
                .with_context(|| format!("Failed to write {}", output.display()))?;
            bail!("{}", message);
        }
        if !audio.exists() {
            bail!("Audio track missing: {}", audio.display());
        }
        self.copy_video(video, output).await
    }

    async fn enhance(&self, input: &Path, output: &Path) -> Result<()> {
        self.copy_video(input, output).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(v: u8) -> RgbImage {
        RgbImage::from_pixel(8, 6, image::Rgb([v, v, v]))
    }

    #[tokio::test]
    async fn test_memory_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        let backend = MemoryBackend::new();

        let mut sink = backend.create_video(&path, 8, 6, 25.0).await.unwrap();
        for v in 0..5 {
            sink.write_frame(&frame(v)).await.unwrap();
        }
        assert_eq!(sink.finish().await.unwrap(), 5);
        assert!(path.exists());

        let (info, mut source) = backend.open_video(&path).await.unwrap();
        assert_eq!(info, VideoInfo { width: 8, height: 6, fps: 25.0, frame_count: 5 });
        let mut seen = Vec::new();
        while let Some(f) = source.next_frame().await.unwrap() {
            seen.push(f.get_pixel(0, 0)[0]);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_memory_mux_failure() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("silent.mp4");
        let audio = dir.path().join("speech.wav");
        std::fs::write(&audio, b"RIFF").unwrap();

        let backend = MemoryBackend::with_failing_mux("no aac encoder");
        backend.insert_video(&video, 25.0, vec![frame(1)]);
        let err = backend
            .mux_audio(&video, &audio, &dir.path().join("out.mp4"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no aac encoder"));
    }

    #[tokio::test]
    async fn test_ffmpeg_frame_round_trip() {
        let config = PipelineConfig::default_config();
        let backend = match FfmpegBackend::new(&config).await {
            Ok(b) => b,
            Err(_) => {
                println!("FFmpeg not available, skipping integration test");
                return;
            }
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        let mut sink = backend.create_video(&path, 64, 48, 25.0).await.unwrap();
        for v in 0..10u8 {
            sink.write_frame(&RgbImage::from_pixel(64, 48, image::Rgb([v * 20, 0, 0])))
                .await
                .unwrap();
        }
        sink.finish().await.unwrap();

        let (info, mut source) = backend.open_video(&path).await.unwrap();
        assert_eq!((info.width, info.height), (64, 48));
        let mut count = 0;
        while source.next_frame().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 10);
    }
}
