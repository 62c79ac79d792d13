//! Per-job orchestration: speech, reference clip, lip sync, post-processing,
//! finalize. Each stage that succeeds moves the job to its progress checkpoint.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::align::align;
use crate::audio::{self, MelConfig, MelSpectrogram, PcmAudio};
use crate::avatar::AvatarStore;
use crate::batch::{BatchScheduler, Emission, FacePlacement, FrameInput};
use crate::cleanup;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::face::{locate_face, FaceDetector, FaceRegion, FixedRegionDetector, NoFaceDetector};
use crate::inference::{run_inference, LipSyncModel};
use crate::job::{self, Job, Stage};
use crate::media::{FrameSink, MediaBackend};
use crate::reconstruct::{reconstruct_batch, FrameSequencer};
use crate::registry::{Artifact, JobRegistry};
use crate::tts::{SpeechRequest, SpeechSynthesizer};

struct Speech {
    path: PathBuf,
    audio: PcmAudio,
}

struct ReferenceVideo {
    path: PathBuf,
    /// Pinned face location from the job or the avatar
    face_hint: Option<FaceRegion>,
}

/// Number of frames in the generated avatar clip
pub fn reference_frame_count(clip_secs: Option<f64>, speech_secs: f64, fps: u32) -> usize {
    let secs = clip_secs.unwrap_or(speech_secs);
    ((secs * fps as f64).ceil() as usize).max(1)
}

fn enhanced_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let ext = output
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_else(|| "mp4".to_string());
    output.with_file_name(format!("{}_enhanced.{}", stem, ext))
}

fn join_error(e: tokio::task::JoinError) -> PipelineError {
    PipelineError::Media(anyhow::anyhow!("background task failed: {}", e))
}

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    registry: Arc<JobRegistry>,
    avatars: AvatarStore,
    tts: Arc<dyn SpeechSynthesizer>,
    model: Arc<dyn LipSyncModel>,
    media: Arc<dyn MediaBackend>,
    detector: Arc<dyn FaceDetector>,
    mel: Arc<MelSpectrogram>,
}

impl Pipeline {
    pub fn new(
        config: Arc<PipelineConfig>,
        registry: Arc<JobRegistry>,
        tts: Arc<dyn SpeechSynthesizer>,
        model: Arc<dyn LipSyncModel>,
        media: Arc<dyn MediaBackend>,
    ) -> Self {
        let avatars = AvatarStore::new(config.avatars_dir.clone());
        let mel = Arc::new(MelSpectrogram::new(MelConfig::from_config(&config)));
        Pipeline {
            config,
            registry,
            avatars,
            tts,
            model,
            media,
            detector: Arc::new(NoFaceDetector),
            mel,
        }
    }

    /// Detector used when neither the job nor the avatar pins the face
    pub fn with_face_detector(mut self, detector: Arc<dyn FaceDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn avatars(&self) -> &AvatarStore {
        &self.avatars
    }

    /// Run every stage of one job. Stage failures end up on the job record,
    /// so the returned snapshot may be `failed` or `cancelled`.
    pub async fn run_job(&self, id: &str) -> Result<Job> {
        let job = match self.registry.begin_processing(id) {
            Ok(job) => job,
            Err(e) => {
                if self.registry.is_cancelled(id) {
                    info!("Job {}: cancelled before start", id);
                    return self.registry.get_status(id);
                }
                return Err(e);
            }
        };
        info!("Job {}: processing (avatar {})", id, job.avatar_id);

        let limit = self.config.job_timeout_secs;
        let result = match tokio::time::timeout(Duration::from_secs(limit), self.execute(&job)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::TimedOut(limit)),
        };

        if self.registry.get_status(id).is_err() {
            // Deleted mid-run: anything written after the delete is still ours to remove
            info!("Job {}: deleted while running, removing what it wrote", id);
            self.remove_temp_artifacts(id);
            if let Err(e) = cleanup::remove_job_artifacts(&job, &self.config.temp_dir, &self.config.output_dir) {
                warn!("Job {}: failed to remove outputs: {}", id, e);
            }
            return Err(PipelineError::job_not_found(id));
        }

        match result {
            Ok(done) => Ok(done),
            Err(PipelineError::Cancelled(_)) => {
                info!("Job {}: cancelled, stopping", id);
                self.remove_temp_artifacts(id);
                self.registry.get_status(id)
            }
            Err(e) => {
                error!("Job {}: failed: {}", id, e);
                if self.config.auto_cleanup_temp {
                    self.remove_temp_artifacts(id);
                }
                match self.registry.fail(id, e.to_string()) {
                    Ok(job) => Ok(job),
                    Err(_) if self.registry.is_cancelled(id) => self.registry.get_status(id),
                    Err(fail_err) => Err(fail_err),
                }
            }
        }
    }

    async fn execute(&self, job: &Job) -> Result<Job> {
        tokio::fs::create_dir_all(&self.config.temp_dir).await?;
        tokio::fs::create_dir_all(&self.config.output_dir).await?;

        let speech = self.synthesize_speech(job).await?;
        self.checkpoint(&job.id, Stage::SynthesizeAudio)?;

        let reference = self.build_reference_video(job, &speech).await?;
        self.checkpoint(&job.id, Stage::ResolveAvatar)?;

        let output = self.lip_sync(job, &speech, &reference).await?;
        self.checkpoint(&job.id, Stage::LipSync)?;

        let output = self.post_process(job, output).await?;
        self.checkpoint(&job.id, Stage::PostProcess)?;

        self.finalize(&job.id, output)
    }

    fn ensure_not_cancelled(&self, id: &str) -> Result<()> {
        if self.registry.is_cancelled(id) {
            return Err(PipelineError::Cancelled(id.to_string()));
        }
        Ok(())
    }

    fn checkpoint(&self, id: &str, stage: Stage) -> Result<()> {
        self.ensure_not_cancelled(id)?;
        match self.registry.record_progress(id, stage.checkpoint()) {
            Ok(job) => {
                info!("Job {}: {} done ({}%)", id, stage.name(), job.progress);
                Ok(())
            }
            Err(_) if self.registry.is_cancelled(id) => Err(PipelineError::Cancelled(id.to_string())),
            Err(e) => Err(e),
        }
    }

    fn temp_path(&self, prefix: &str, id: &str, ext: &str) -> PathBuf {
        self.config.temp_dir.join(format!("{}_{}.{}", prefix, id, ext))
    }

    fn speech_path(&self, id: &str) -> PathBuf {
        self.temp_path("speech", id, "wav")
    }

    fn avatar_clip_path(&self, id: &str) -> PathBuf {
        self.temp_path("avatar", id, "mp4")
    }

    async fn synthesize_speech(&self, job: &Job) -> Result<Speech> {
        let request = SpeechRequest::from_config(&self.config, &job.script, job.voice_id.as_deref());
        let bytes = self.tts.synthesize(&request).await?;

        let rate = self.config.audio_sample_rate;
        let wav_path = self.speech_path(&job.id);
        self.registry.record_artifact(&job.id, Artifact::Audio, wav_path.clone())?;

        if audio::is_wav(&bytes) {
            let pcm = audio::to_target_rate(audio::decode_wav_bytes(&bytes)?, rate);
            audio::write_wav_mono(&wav_path, &pcm)?;
        } else {
            // Compressed provider output goes through the media backend
            let raw_path = self.temp_path("speech", &job.id, "src");
            tokio::fs::write(&raw_path, &bytes).await?;
            let converted = self.media.transcode_audio(&raw_path, &wav_path, rate).await;
            if let Err(e) = cleanup::remove_temp_artifact(&raw_path, &self.config.temp_dir) {
                warn!("Job {}: failed to remove {}: {}", job.id, raw_path.display(), e);
            }
            converted?;
        }

        let audio = audio::to_target_rate(audio::read_wav_mono(&wav_path)?, rate);
        if audio.samples.is_empty() {
            return Err(PipelineError::external("tts", "synthesized speech is empty"));
        }
        info!("Job {}: {:.2}s of speech", job.id, audio.duration_secs());
        Ok(Speech { path: wav_path, audio })
    }

    async fn build_reference_video(&self, job: &Job, speech: &Speech) -> Result<ReferenceVideo> {
        let avatar = self.avatars.load(&job.avatar_id)?;
        let frame = self.avatars.reference_frame(&job.avatar_id, 0)?;

        let frame_count = reference_frame_count(
            self.config.reference_clip_secs,
            speech.audio.duration_secs(),
            self.config.video_fps,
        );
        let path = self.avatar_clip_path(&job.id);
        self.registry
            .record_artifact(&job.id, Artifact::AvatarVideo, path.clone())?;

        let mut sink = self
            .media
            .create_video(&path, frame.width(), frame.height(), self.config.video_fps as f64)
            .await?;
        for _ in 0..frame_count {
            sink.write_frame(&frame).await?;
        }
        sink.finish().await?;
        debug!("Job {}: reference clip of {} frames at {}", job.id, frame_count, path.display());

        Ok(ReferenceVideo {
            path,
            face_hint: job.settings.face_region.or(avatar.face_region),
        })
    }

    async fn lip_sync(&self, job: &Job, speech: &Speech, reference: &ReferenceVideo) -> Result<PathBuf> {
        let mel = Arc::clone(&self.mel);
        let samples = speech.audio.samples.clone();
        let features = tokio::task::spawn_blocking(move || mel.compute(&samples))
            .await
            .map_err(join_error)?;

        let (info, mut source) = self.media.open_video(&reference.path).await?;
        let windows = align(&features, info.frame_count, self.config.mel_step_size)?;
        debug!(
            "Job {}: {} feature rows aligned onto {} frames",
            job.id,
            features.nrows(),
            windows.len()
        );

        let (detector, min_size): (Arc<dyn FaceDetector>, u32) = match reference.face_hint {
            Some(region) => (Arc::new(FixedRegionDetector::new(region)) as Arc<dyn FaceDetector>, 0),
            None => (Arc::clone(&self.detector), self.config.min_face_size),
        };

        let silent_path = self.config.output_dir.join(format!("{}_silent.mp4", job.id));
        let mut sink = self
            .media
            .create_video(&silent_path, info.width, info.height, info.fps)
            .await?;
        let mut scheduler = BatchScheduler::new(self.config.batch_size)?;
        let mut sequencer = FrameSequencer::new(windows.len());
        let mut windows = windows.into_iter();
        let mut index = 0;
        let mut passed_through = 0;

        while let Some(frame) = source.next_frame().await? {
            let window = windows.next().ok_or_else(|| {
                PipelineError::Validation(format!(
                    "reference video has more frames than the {} probed",
                    info.frame_count
                ))
            })?;
            let face = locate_face(detector.as_ref(), &frame, min_size, index).and_then(|detected| {
                FacePlacement::new(detected, self.config.face_padding_ratio, frame.width(), frame.height())
            });
            if face.is_none() {
                passed_through += 1;
            }
            if let Some(emission) = scheduler.push(FrameInput {
                index,
                frame,
                window,
                face,
            }) {
                self.dispatch(&job.id, emission, &mut sequencer, sink.as_mut()).await?;
            }
            index += 1;
        }
        if let Some(batch) = scheduler.finish() {
            self.dispatch(&job.id, Emission::Batch(batch), &mut sequencer, sink.as_mut())
                .await?;
        }

        let released = sequencer.finish()?;
        let written = sink.finish().await?;
        if written != released {
            return Err(PipelineError::Media(anyhow::anyhow!(
                "wrote {} frames but reconstructed {}",
                written,
                released
            )));
        }
        if passed_through > 0 {
            warn!(
                "Job {}: {} of {} frames had no usable face and were passed through",
                job.id, passed_through, released
            );
        }

        let final_path = job
            .settings
            .output_path
            .clone()
            .unwrap_or_else(|| self.config.output_dir.join(format!("{}.mp4", job.id)));
        if let Some(parent) = final_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        match self.media.mux_audio(&silent_path, &speech.path, &final_path).await {
            Ok(()) => Ok(final_path),
            Err(e) => {
                warn!(
                    "Job {}: adding audio failed, keeping silent video {}: {:#}",
                    job.id,
                    silent_path.display(),
                    e
                );
                if final_path != silent_path && final_path.is_file() {
                    if let Err(e) = tokio::fs::remove_file(&final_path).await {
                        warn!("Job {}: failed to remove partial {}: {}", job.id, final_path.display(), e);
                    }
                }
                Ok(silent_path)
            }
        }
    }

    /// Route one scheduler emission to the output in frame order
    async fn dispatch(
        &self,
        job_id: &str,
        emission: Emission,
        sequencer: &mut FrameSequencer,
        sink: &mut dyn FrameSink,
    ) -> Result<()> {
        let ready = match emission {
            Emission::PassThrough { index, frame } => sequencer.push(index, frame)?,
            Emission::Batch(batch) => {
                self.ensure_not_cancelled(job_id)?;
                let inputs = batch.inference_inputs(self.config.model_input_size);
                let model = Arc::clone(&self.model);
                let outputs = tokio::task::spawn_blocking(move || run_inference(model.as_ref(), &inputs))
                    .await
                    .map_err(join_error)??;
                debug!("Job {}: inferred batch of {} faces", job_id, batch.len());

                let mut ready = Vec::new();
                for (index, frame) in reconstruct_batch(&batch, &outputs)? {
                    ready.extend(sequencer.push(index, frame)?);
                }
                ready
            }
        };
        for frame in &ready {
            sink.write_frame(frame).await?;
        }
        Ok(())
    }

    async fn post_process(&self, job: &Job, output: PathBuf) -> Result<PathBuf> {
        if !job.settings.enhance_quality {
            return Ok(output);
        }
        let enhanced = enhanced_path(&output);
        self.media.enhance(&output, &enhanced).await?;
        info!("Job {}: enhanced video written to {}", job.id, enhanced.display());
        Ok(enhanced)
    }

    fn finalize(&self, id: &str, output: PathBuf) -> Result<Job> {
        self.ensure_not_cancelled(id)?;
        if self.config.auto_cleanup_temp {
            self.remove_temp_artifacts(id);
        }
        match self.registry.complete(id, output) {
            Ok(job) => {
                info!(
                    "Job {}: completed -> {}",
                    id,
                    job.output_path.as_deref().map(|p| p.display().to_string()).unwrap_or_default()
                );
                Ok(job)
            }
            Err(_) if self.registry.is_cancelled(id) => Err(PipelineError::Cancelled(id.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Remove this job's scratch files, whether or not its record still exists
    fn remove_temp_artifacts(&self, id: &str) {
        let scratch = [
            self.speech_path(id),
            self.temp_path("speech", id, "src"),
            self.avatar_clip_path(id),
        ];
        for path in scratch {
            if let Err(e) = cleanup::remove_temp_artifact(&path, &self.config.temp_dir) {
                warn!("Job {}: failed to remove {}: {}", id, path.display(), e);
            }
        }
    }

    /// Flag a job as cancelled; a running worker stops at its next check
    pub fn cancel_job(&self, id: &str) -> Result<Job> {
        self.registry.cancel(id)
    }

    /// Drop a job record along with its temp, output and state files.
    ///
    /// A running job is cancelled first; its worker removes whatever it
    /// writes after this returns.
    pub fn delete_job(&self, id: &str) -> Result<Job> {
        if let Ok(job) = self.registry.get_status(id) {
            if !job.status.is_terminal() {
                if let Err(e) = self.registry.cancel(id) {
                    warn!("Job {}: cancel before delete failed: {}", id, e);
                }
            }
        }
        let job = self.registry.delete(id)?;
        cleanup::remove_job_artifacts(&job, &self.config.temp_dir, &self.config.output_dir)?;

        let state = job::job_state_path(id, &self.config.job_state_dir);
        if state.is_file() {
            std::fs::remove_file(&state)?;
        }
        Ok(job)
    }
}
