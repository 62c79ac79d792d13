//! Speech audio handling: mono PCM I/O and the log-mel features the lip-sync
//! model is conditioned on.

use std::io::{Cursor, Read};
use std::path::Path;

use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use ndarray::Array2;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use crate::config::PipelineConfig;

/// Decoded mono audio
#[derive(Debug, Clone, PartialEq)]
pub struct PcmAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PcmAudio {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// True when `bytes` starts with a RIFF/WAVE header
pub fn is_wav(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

fn decode_wav<R: Read>(reader: WavReader<R>) -> Result<PcmAudio> {
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("Failed to read audio samples")?
                .into_iter()
                .map(|s| s as f32 / max_val)
                .collect()
        }
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read audio samples")?,
    };

    // Down-mix by averaging channels
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok(PcmAudio {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// Read a WAV file as mono samples in [-1, 1]
pub fn read_wav_mono(path: &Path) -> Result<PcmAudio> {
    let reader = WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file: {}", path.display()))?;
    decode_wav(reader).with_context(|| format!("Failed to decode WAV file: {}", path.display()))
}

/// Decode in-memory WAV bytes as mono samples
pub fn decode_wav_bytes(bytes: &[u8]) -> Result<PcmAudio> {
    let reader = WavReader::new(Cursor::new(bytes)).context("Failed to parse WAV header")?;
    decode_wav(reader)
}

/// Write mono 16-bit PCM
pub fn write_wav_mono(path: &Path, audio: &PcmAudio) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: audio.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create WAV file: {}", path.display()))?;
    for &s in &audio.samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
        writer.write_sample(v)?;
    }
    writer
        .finalize()
        .with_context(|| format!("Failed to finalize WAV file: {}", path.display()))?;
    Ok(())
}

/// Linear-interpolation resampler
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }
    let out_len = ((samples.len() as u64 * to_rate as u64) / from_rate as u64).max(1) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            samples[idx] * (1.0 - frac) + samples[next] * frac
        })
        .collect()
}

/// Mono audio at `target_rate`
pub fn to_target_rate(audio: PcmAudio, target_rate: u32) -> PcmAudio {
    if audio.sample_rate == target_rate {
        return audio;
    }
    PcmAudio {
        samples: resample_linear(&audio.samples, audio.sample_rate, target_rate),
        sample_rate: target_rate,
    }
}

#[derive(Debug, Clone)]
pub struct MelConfig {
    pub sample_rate: u32,
    pub n_fft: usize,
    pub hop_length: usize,
    pub win_length: usize,
    pub n_mels: usize,
    pub f_min: f32,
    pub f_max: f32,
    /// Dynamic range kept below the loudest bin, in dB
    pub top_db: f32,
}

impl MelConfig {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        MelConfig {
            sample_rate: cfg.audio_sample_rate,
            n_fft: cfg.n_fft,
            hop_length: cfg.hop_length,
            win_length: cfg.win_length.min(cfg.n_fft),
            n_mels: cfg.n_mels,
            f_min: cfg.f_min,
            f_max: cfg.f_max,
            top_db: 80.0,
        }
    }

    /// Feature rows produced per second of audio
    pub fn rows_per_second(&self) -> f64 {
        self.sample_rate as f64 / self.hop_length as f64
    }
}

/// Log-mel spectrogram, one row per hop
pub struct MelSpectrogram {
    config: MelConfig,
    /// Shape: [n_mels, n_fft / 2 + 1]
    filterbank: Array2<f32>,
    /// Hann window of `win_length`, centred in `n_fft`
    window: Vec<f32>,
}

impl MelSpectrogram {
    pub fn new(config: MelConfig) -> Self {
        let filterbank = mel_filterbank(
            config.n_fft / 2 + 1,
            config.n_mels,
            config.sample_rate as f32,
            config.f_min,
            config.f_max.min(config.sample_rate as f32 / 2.0),
        );
        let window = centred_hann(config.win_length, config.n_fft);
        MelSpectrogram {
            config,
            filterbank,
            window,
        }
    }

    pub fn config(&self) -> &MelConfig {
        &self.config
    }

    /// Features shaped `[rows, n_mels]`, in dB relative to the loudest bin
    pub fn compute(&self, waveform: &[f32]) -> Array2<f32> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let n_freqs = n_fft / 2 + 1;

        let padded = reflect_pad(waveform, n_fft / 2);
        let rows = if padded.len() >= n_fft {
            (padded.len() - n_fft) / hop + 1
        } else {
            1
        };

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(n_fft);
        let mut power = Array2::<f32>::zeros((rows, n_freqs));
        let mut buffer = vec![Complex::new(0.0f32, 0.0); n_fft];

        for row in 0..rows {
            let start = row * hop;
            for (i, slot) in buffer.iter_mut().enumerate() {
                let s = padded.get(start + i).copied().unwrap_or(0.0);
                *slot = Complex::new(s * self.window[i], 0.0);
            }
            fft.process(&mut buffer);
            for (f, c) in buffer[..n_freqs].iter().enumerate() {
                power[[row, f]] = c.norm_sqr();
            }
        }

        // [rows, n_freqs] x [n_freqs, n_mels]
        let mel = power.dot(&self.filterbank.t());
        power_to_db(mel, self.config.top_db)
    }
}

/// `10 * log10(S / max(S))`, floored at `top_db` below the peak
fn power_to_db(mut mel: Array2<f32>, top_db: f32) -> Array2<f32> {
    const AMIN: f32 = 1e-10;
    let peak = mel.iter().fold(AMIN, |acc, &v| acc.max(v));
    let ref_db = 10.0 * peak.max(AMIN).log10();
    mel.mapv_inplace(|v| 10.0 * v.max(AMIN).log10() - ref_db);
    let floor = mel.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v)) - top_db;
    mel.mapv_inplace(|v| v.max(floor));
    mel
}

fn centred_hann(win_length: usize, n_fft: usize) -> Vec<f32> {
    let mut window = vec![0.0; n_fft];
    let offset = (n_fft - win_length) / 2;
    for i in 0..win_length {
        window[offset + i] =
            0.5 * (1.0 - f32::cos(2.0 * std::f32::consts::PI * i as f32 / win_length as f32));
    }
    window
}

fn reflect_pad(waveform: &[f32], pad: usize) -> Vec<f32> {
    if waveform.is_empty() {
        return vec![0.0; pad * 2];
    }
    let n = waveform.len();
    let mut out = Vec::with_capacity(n + pad * 2);
    for i in 0..pad {
        out.push(waveform[(pad - i).min(n - 1)]);
    }
    out.extend_from_slice(waveform);
    for i in 0..pad {
        out.push(waveform[n.saturating_sub(2 + i)]);
    }
    out
}

/// Slaney-style mel filterbank, shape `[n_mels, n_freqs]`
fn mel_filterbank(n_freqs: usize, n_mels: usize, sample_rate: f32, f_min: f32, f_max: f32) -> Array2<f32> {
    let fft_freqs: Vec<f32> = (0..n_freqs)
        .map(|i| (sample_rate / 2.0) * i as f32 / (n_freqs - 1).max(1) as f32)
        .collect();

    let mel_min = hertz_to_mel(f_min);
    let mel_max = hertz_to_mel(f_max);
    let filter_freqs: Vec<f32> = (0..=n_mels + 1)
        .map(|i| mel_to_hertz(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
        .collect();

    let mut filters = Array2::<f32>::zeros((n_mels, n_freqs));
    for m in 0..n_mels {
        let (lower, center, upper) = (filter_freqs[m], filter_freqs[m + 1], filter_freqs[m + 2]);
        let norm = if upper > lower { 2.0 / (upper - lower) } else { 0.0 };
        for (f, &freq) in fft_freqs.iter().enumerate() {
            let down = if center > lower { (freq - lower) / (center - lower) } else { 0.0 };
            let up = if upper > center { (upper - freq) / (upper - center) } else { 0.0 };
            filters[[m, f]] = down.min(up).max(0.0) * norm;
        }
    }
    filters
}

fn hertz_to_mel(freq: f32) -> f32 {
    let min_log_hertz = 1000.0;
    let min_log_mel = 15.0;
    let logstep = 27.0 / (6.4f32).ln();

    if freq < min_log_hertz {
        3.0 * freq / 200.0
    } else {
        min_log_mel + (freq / min_log_hertz).ln() * logstep
    }
}

fn mel_to_hertz(mel: f32) -> f32 {
    let min_log_hertz = 1000.0;
    let min_log_mel = 15.0;
    let logstep = (6.4f32).ln() / 27.0;

    if mel < min_log_mel {
        200.0 * mel / 3.0
    } else {
        min_log_hertz * ((mel - min_log_mel) * logstep).exp()
    }
}
