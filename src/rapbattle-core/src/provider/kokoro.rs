//! Local fallback voice provider using kokoro-tiny.
//!
//! The engine downloads its model on first use, so it is created lazily the
//! first time a verse is synthesized rather than when availability is checked.
//! Kokoro cannot clone voices; cloning requests resolve to the default local voice.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kokoro_tiny::TtsEngine;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::{ProviderTier, StyleHints, VoiceHandle, VoiceProvider, VoiceSample};
use crate::audio::{AudioClip, PIPELINE_SAMPLE_RATE};
use crate::config::VoiceConfig;
use crate::error::ProviderError;
use crate::participant::{DeliveryStyle, Speaker};

const PROVIDER_NAME: &str = "kokoro";

/// Kokoro has a ~200 character safe limit per synthesis call.
const MAX_CHUNK_CHARS: usize = 200;

/// Pause between chunks (0.3 s at 24 kHz).
const CHUNK_PAUSE_SAMPLES: usize = 7200;

/// Trailing padding so the last word is not cut off (0.5 s at 24 kHz).
const TRAILING_PAD_SAMPLES: usize = 12000;

struct LoadedEngine {
    engine: Mutex<TtsEngine>,
    voices: Vec<String>,
}

/// Fallback voice provider running on the local machine.
pub struct KokoroVoice {
    engine: OnceCell<Arc<LoadedEngine>>,
    config: VoiceConfig,
}

impl KokoroVoice {
    pub fn new(config: VoiceConfig) -> Self {
        Self {
            engine: OnceCell::new(),
            config,
        }
    }

    async fn engine(&self) -> Result<Arc<LoadedEngine>, ProviderError> {
        let loaded = self
            .engine
            .get_or_try_init(|| async {
                debug!("initializing kokoro engine");
                let engine = TtsEngine::new().await.map_err(|e| {
                    ProviderError::synthesis(PROVIDER_NAME, format!("Failed to initialize TTS: {}", e))
                })?;
                let voices = engine.voices();
                Ok::<_, ProviderError>(Arc::new(LoadedEngine {
                    engine: Mutex::new(engine),
                    voices,
                }))
            })
            .await?;
        Ok(Arc::clone(loaded))
    }
}

#[async_trait]
impl VoiceProvider for KokoroVoice {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn tier(&self) -> ProviderTier {
        ProviderTier::Fallback
    }

    async fn is_available(&self) -> bool {
        !self.config.disable_local
    }

    async fn clone_voice(
        &self,
        speaker: Speaker,
        sample: &VoiceSample,
    ) -> Result<VoiceHandle, ProviderError> {
        debug!(%speaker, sample = %sample.path.display(), "kokoro cannot clone, using preset voice");
        Ok(VoiceHandle::preset(PROVIDER_NAME, &self.config.local_default_voice))
    }

    fn preset_voice(&self, style: DeliveryStyle) -> VoiceHandle {
        VoiceHandle::preset(PROVIDER_NAME, self.config.local_voice(style))
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceHandle,
        hints: &StyleHints,
    ) -> Result<AudioClip, ProviderError> {
        let loaded = self.engine().await?;

        let voice_id = if loaded.voices.contains(&voice.voice_id) {
            voice.voice_id.clone()
        } else {
            warn!(voice = %voice.voice_id, fallback = %self.config.local_default_voice, "unknown kokoro voice");
            self.config.local_default_voice.clone()
        };
        let chunks = split_into_chunks(text, MAX_CHUNK_CHARS);
        let speed = hints.speed();

        let samples = tokio::task::spawn_blocking(move || {
            let mut engine = loaded.engine.lock().unwrap_or_else(|e| e.into_inner());
            let mut all_samples = Vec::new();

            for chunk in chunks {
                let samples = engine
                    .synthesize(&chunk, Some(voice_id.as_str()))
                    .map_err(|e| ProviderError::synthesis(PROVIDER_NAME, format!("Synthesis failed: {}", e)))?;
                all_samples.extend(samples);
                all_samples.extend(std::iter::repeat_n(0.0, CHUNK_PAUSE_SAMPLES));
            }
            all_samples.extend(std::iter::repeat_n(0.0, TRAILING_PAD_SAMPLES));
            Ok::<_, ProviderError>(all_samples)
        })
        .await
        .map_err(|e| ProviderError::synthesis(PROVIDER_NAME, e))??;

        Ok(change_speed(AudioClip::new(samples, PIPELINE_SAMPLE_RATE), speed))
    }
}

/// Speed a clip up (`rate > 1`) or down by resampling.
fn change_speed(clip: AudioClip, rate: f32) -> AudioClip {
    if (rate - 1.0).abs() < 0.001 {
        return clip;
    }
    let original_rate = clip.sample_rate;
    let shifted = ((original_rate as f32) * rate).round() as u32;
    AudioClip::new(clip.samples, shifted).resample(original_rate)
}

/// Split text into chunks that are safe for TTS synthesis.
///
/// Bars (lines) and sentences are kept whole where they fit.
fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current_chunk = String::new();

    for sentence in text.split_inclusive(&['.', '!', '?', ';', '\n'][..]) {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }

        if current_chunk.len() + sentence.len() > max_chars {
            if !current_chunk.is_empty() {
                chunks.push(current_chunk.trim().to_string());
                current_chunk = String::new();
            }

            if sentence.len() > max_chars {
                for part in sentence.split_inclusive(',') {
                    if current_chunk.len() + part.len() > max_chars && !current_chunk.is_empty() {
                        chunks.push(current_chunk.trim().to_string());
                        current_chunk = String::new();
                    }
                    current_chunk.push_str(part);
                    current_chunk.push(' ');
                }
            } else {
                current_chunk.push_str(sentence);
                current_chunk.push(' ');
            }
        } else {
            current_chunk.push_str(sentence);
            current_chunk.push(' ');
        }
    }

    if !current_chunk.trim().is_empty() {
        chunks.push(current_chunk.trim().to_string());
    }

    chunks
}
