//! Text-to-speech seam and the ElevenLabs HTTP client.

use std::path::PathBuf;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};

/// One synthesis call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeechRequest {
    pub text: String,
    pub voice_id: String,
    pub stability: f32,
    pub similarity_boost: f32,
    pub model: String,
}

impl SpeechRequest {
    /// Request using the configured voice defaults, with an optional voice override
    pub fn from_config(config: &PipelineConfig, text: &str, voice_id: Option<&str>) -> Self {
        SpeechRequest {
            text: text.to_string(),
            voice_id: voice_id.unwrap_or(&config.default_voice_id).to_string(),
            stability: config.voice_stability,
            similarity_boost: config.voice_similarity_boost,
            model: config.voice_model.clone(),
        }
    }
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Raw audio bytes in whatever container the provider returns
    async fn synthesize(&self, request: &SpeechRequest) -> Result<Vec<u8>>;
}

/// A voice available to the account
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VoiceInfo {
    pub voice_id: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VoicesResponse {
    voices: Vec<VoiceInfo>,
}

#[derive(Debug, Deserialize)]
struct AddVoiceResponse {
    voice_id: String,
}

/// HTTP client for the ElevenLabs API
pub struct ElevenLabsClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ElevenLabsClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.elevenlabs_base_url.clone(), config.elevenlabs_api_key.clone())
    }

    fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| PipelineError::Validation("ELEVENLABS_API_KEY is not set".to_string()))
    }

    /// Voices visible to the configured key
    pub async fn list_voices(&self) -> Result<Vec<VoiceInfo>> {
        let response = self
            .client
            .get(format!("{}/v1/voices", self.base_url))
            .header("xi-api-key", self.api_key()?)
            .send()
            .await
            .map_err(|e| PipelineError::external("tts", e.to_string()))?;

        let response = Self::ensure_success(response).await?;
        let body: VoicesResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::external("tts", format!("invalid voices response: {}", e)))?;
        Ok(body.voices)
    }

    /// Create a cloned voice from speech samples; returns the new voice id
    pub async fn clone_voice(&self, name: &str, description: Option<&str>, samples: &[PathBuf]) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(PipelineError::Validation("voice name is empty".to_string()));
        }
        if samples.is_empty() {
            return Err(PipelineError::Validation("at least one audio sample is required".to_string()));
        }
        let api_key = self.api_key()?;

        let description = description
            .map(str::to_string)
            .unwrap_or_else(|| format!("Cloned voice: {}", name));
        let mut form = Form::new()
            .text("name", name.to_string())
            .text("description", description);
        for path in samples {
            let bytes = tokio::fs::read(path).await.map_err(|e| {
                PipelineError::Validation(format!("unreadable voice sample {}: {}", path.display(), e))
            })?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "sample".to_string());
            form = form.part("files", Part::bytes(bytes).file_name(file_name));
        }

        info!("Cloning voice '{}' from {} sample(s)", name, samples.len());
        let response = self
            .client
            .post(format!("{}/v1/voices/add", self.base_url))
            .header("xi-api-key", api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| PipelineError::external("tts", e.to_string()))?;

        let response = Self::ensure_success(response).await?;
        let body: AddVoiceResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::external("tts", format!("invalid clone response: {}", e)))?;
        info!("Voice '{}' cloned as {}", name, body.voice_id);
        Ok(body.voice_id)
    }

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read response body>".to_string());
        Err(PipelineError::external("tts", format!("HTTP {}: {}", status.as_u16(), body)))
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsClient {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<Vec<u8>> {
        let body = serde_json::json!({
            "text": request.text,
            "model_id": request.model,
            "voice_settings": {
                "stability": request.stability,
                "similarity_boost": request.similarity_boost,
            },
        });

        debug!(
            "Requesting speech for {} chars with voice {}",
            request.text.len(),
            request.voice_id
        );

        let response = self
            .client
            .post(format!("{}/v1/text-to-speech/{}", self.base_url, request.voice_id))
            .header("xi-api-key", self.api_key()?)
            .header("accept", "audio/mpeg")
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::external("tts", e.to_string()))?;

        let response = Self::ensure_success(response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PipelineError::external("tts", e.to_string()))?;

        if bytes.is_empty() {
            return Err(PipelineError::external("tts", "provider returned no audio"));
        }
        info!("Synthesized {} bytes of speech", bytes.len());
        Ok(bytes.to_vec())
    }
}
