//! Fixtures shared by the pipeline, worker and inbox tests.

use std::sync::Arc;

use async_trait::async_trait;
use image::RgbImage;

use crate::avatar::AvatarStore;
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::face::FaceRegion;
use crate::inference::LipSyncModel;
use crate::job::{Job, JobRequest, JobSettings};
use crate::media::{MediaBackend, MemoryBackend};
use crate::pipeline::Pipeline;
use crate::registry::JobRegistry;
use crate::tts::{SpeechRequest, SpeechSynthesizer};

/// 31680 samples at 16 kHz -> 50 feature rows and 50 frames at 25 fps
pub const SPEECH_SAMPLES: usize = 31_680;

pub const REFERENCE_PIXEL: [u8; 3] = [40, 80, 120];

/// 16-bit mono WAV holding a quiet 220 Hz tone
pub fn wav_bytes(samples: usize, rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for i in 0..samples {
            let t = i as f32 / rate as f32;
            let s = (2.0 * std::f32::consts::PI * 220.0 * t).sin() * 0.3;
            writer.write_sample((s * i16::MAX as f32) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// Always answers with the same audio
pub struct FakeTts {
    pub bytes: Vec<u8>,
}

impl FakeTts {
    pub fn speech() -> Self {
        FakeTts {
            bytes: wav_bytes(SPEECH_SAMPLES, 16_000),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeTts {
    async fn synthesize(&self, _request: &SpeechRequest) -> Result<Vec<u8>> {
        Ok(self.bytes.clone())
    }
}

pub struct Fixture {
    pub _dir: tempfile::TempDir,
    pub config: Arc<PipelineConfig>,
    pub registry: Arc<JobRegistry>,
    pub backend: Arc<MemoryBackend>,
    pub avatar_id: String,
}

impl Fixture {
    /// Data dir with one 64x48 avatar, small batches
    pub fn new(face: Option<FaceRegion>, tweak: impl FnOnce(&mut PipelineConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::with_data_dir(dir.path().to_path_buf());
        config.batch_size = 8;
        tweak(&mut config);
        config.ensure_dirs().unwrap();

        let frame_path = dir.path().join("reference.png");
        RgbImage::from_pixel(64, 48, image::Rgb(REFERENCE_PIXEL))
            .save(&frame_path)
            .unwrap();
        let avatar = AvatarStore::new(config.avatars_dir.clone())
            .import("Presenter", &[frame_path], face)
            .unwrap();

        Fixture {
            _dir: dir,
            config: Arc::new(config),
            registry: Arc::new(JobRegistry::new()),
            backend: Arc::new(MemoryBackend::new()),
            avatar_id: avatar.id,
        }
    }

    pub fn pipeline(&self, tts: Arc<dyn SpeechSynthesizer>, model: Arc<dyn LipSyncModel>) -> Pipeline {
        Pipeline::new(
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            tts,
            model,
            Arc::clone(&self.backend) as Arc<dyn MediaBackend>,
        )
    }

    pub fn request(&self) -> JobRequest {
        JobRequest::new("Hello and welcome to the demo.", self.avatar_id.clone())
    }

    /// Register a pending job directly, bypassing any queue
    pub fn submit(&self, settings: JobSettings) -> String {
        let mut request = self.request();
        request.settings = settings;
        self.registry.submit(Job::new(request)).unwrap()
    }
}
