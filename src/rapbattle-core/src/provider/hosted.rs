//! Hosted voice provider (ElevenLabs-compatible HTTP API).
//!
//! Supports cloning from a participant sample. Audio is requested as raw
//! 16-bit PCM at the pipeline sample rate so no decoder is needed.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{ProviderTier, StyleHints, VoiceHandle, VoiceProvider, VoiceSample};
use crate::audio::{AudioClip, PIPELINE_SAMPLE_RATE};
use crate::config::VoiceConfig;
use crate::error::ProviderError;
use crate::participant::{DeliveryStyle, Speaker};

const PROVIDER_NAME: &str = "hosted";

/// Premade voice used for styles without a configured preset.
const DEFAULT_PRESET_VOICE: &str = "pNInz6obpgDQGcFmaJgB";

#[derive(Debug, Deserialize)]
struct AddVoiceResponse {
    voice_id: String,
}

/// Primary voice provider backed by a hosted text-to-speech API.
pub struct HostedVoice {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    presets: HashMap<String, String>,
}

impl HostedVoice {
    pub fn new(config: &VoiceConfig, api_key: Option<String>, client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: config.hosted_base_url.trim_end_matches('/').to_string(),
            model: config.hosted_model.clone(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            presets: config.hosted_presets.clone(),
        }
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Unavailable {
                provider: PROVIDER_NAME.to_string(),
                reason: "VOICE_API_KEY is not set".to_string(),
            })
    }
}

/// Turn a non-success response into a provider error carrying the body.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::GenerationFailed {
        provider: PROVIDER_NAME.to_string(),
        detail: format!("HTTP {}: {}", status, body),
    })
}

#[async_trait]
impl VoiceProvider for HostedVoice {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn tier(&self) -> ProviderTier {
        ProviderTier::Primary
    }

    async fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn clone_voice(
        &self,
        speaker: Speaker,
        sample: &VoiceSample,
    ) -> Result<VoiceHandle, ProviderError> {
        let api_key = self.api_key()?;
        let part = Part::bytes(sample.bytes.clone())
            .file_name(sample.file_name())
            .mime_str(sample.mime_type())?;
        let form = Form::new()
            .part("files", part)
            .text("name", format!("{} ({})", sample.name, speaker))
            .text("description", format!("Cloned voice: {}", sample.name));

        let response = self
            .client
            .post(format!("{}/voices/add", self.base_url))
            .header("xi-api-key", api_key)
            .multipart(form)
            .send()
            .await?;
        let added: AddVoiceResponse = check_status(response).await?.json().await?;

        debug!(%speaker, voice_id = %added.voice_id, "voice cloned");
        Ok(VoiceHandle {
            provider: PROVIDER_NAME.to_string(),
            voice_id: added.voice_id,
            cloned: true,
        })
    }

    fn preset_voice(&self, style: DeliveryStyle) -> VoiceHandle {
        let voice_id = self
            .presets
            .get(style.key())
            .map(String::as_str)
            .unwrap_or(DEFAULT_PRESET_VOICE);
        VoiceHandle::preset(PROVIDER_NAME, voice_id)
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceHandle,
        hints: &StyleHints,
    ) -> Result<AudioClip, ProviderError> {
        let api_key = self.api_key()?;
        let stability = if hints.finale { 0.3 } else { 0.45 };
        let body = json!({
            "text": text,
            "model_id": self.model,
            "voice_settings": {
                "stability": stability,
                "similarity_boost": 0.8,
                "style": 0.6,
                "speed": hints.speed().clamp(0.7, 1.2),
            },
        });

        let response = self
            .client
            .post(format!(
                "{}/text-to-speech/{}?output_format=pcm_{}",
                self.base_url, voice.voice_id, PIPELINE_SAMPLE_RATE
            ))
            .header("xi-api-key", api_key)
            .json(&body)
            .send()
            .await?;
        let bytes = check_status(response).await?.bytes().await?;

        let clip = AudioClip::from_pcm16le(&bytes, PIPELINE_SAMPLE_RATE);
        if clip.is_empty() {
            return Err(ProviderError::EmptyResponse {
                provider: PROVIDER_NAME.to_string(),
            });
        }
        Ok(clip)
    }
}
