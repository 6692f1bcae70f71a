//! External provider adapters.
//!
//! Voice synthesis sits behind [`VoiceProvider`] with a priority-ordered
//! fallback: the first provider that reports itself available is bound for
//! the whole battle. Text and lip-sync generation have their own traits.

pub mod hosted;
pub mod kokoro;
pub mod lipsync;
pub mod openai;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::audio::AudioClip;
use crate::battle::BeatStyle;
use crate::error::{BattleError, ProviderError, StageFailure};
use crate::lyrics::VersePrompt;
use crate::participant::{DeliveryStyle, ParticipantInput, Speaker};

pub use hosted::HostedVoice;
pub use kokoro::KokoroVoice;
pub use lipsync::HostedLipSync;
pub use openai::OpenAiLyricist;

/// Where a voice provider sits in the fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderTier {
    Primary,
    Fallback,
}

/// A voice selected for one speaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceHandle {
    pub provider: String,
    pub voice_id: String,
    /// True when created from the participant's own sample.
    pub cloned: bool,
}

impl VoiceHandle {
    pub fn preset(provider: impl Into<String>, voice_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            voice_id: voice_id.into(),
            cloned: false,
        }
    }
}

/// Reference audio used to clone a participant's voice.
#[derive(Debug, Clone)]
pub struct VoiceSample {
    pub path: PathBuf,
    pub name: String,
    pub bytes: Vec<u8>,
}

impl VoiceSample {
    pub async fn load(path: &Path, name: &str) -> Result<Self, StageFailure> {
        let bytes = tokio::fs::read(path).await?;
        if bytes.is_empty() {
            return Err(StageFailure::Invalid(format!(
                "voice sample '{}' is empty",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            name: name.to_string(),
            bytes,
        })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sample.wav".to_string())
    }

    /// MIME type guessed from the file extension.
    pub fn mime_type(&self) -> &'static str {
        let extension = self
            .path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("wav") => "audio/wav",
            Some("mp3") => "audio/mpeg",
            Some("m4a" | "mp4") => "audio/mp4",
            Some("ogg" | "oga") => "audio/ogg",
            Some("flac") => "audio/flac",
            Some("webm") => "audio/webm",
            _ => "application/octet-stream",
        }
    }
}

/// Delivery hints for one verse.
#[derive(Debug, Clone, PartialEq)]
pub struct StyleHints {
    pub style: DeliveryStyle,
    pub beat_style: BeatStyle,
    pub bpm: Option<u32>,
    pub finale: bool,
}

impl StyleHints {
    /// Tempo band description: slow, moderate, energetic or rapid-fire.
    pub fn tempo_description(&self) -> &'static str {
        match self.bpm {
            Some(bpm) if (60..90).contains(&bpm) => "slow, deliberate",
            Some(bpm) if (90..120).contains(&bpm) => "moderate groove",
            Some(bpm) if (120..150).contains(&bpm) => "energetic, punchy",
            Some(bpm) if (150..180).contains(&bpm) => "rapid-fire, intense",
            _ => "moderate",
        }
    }

    /// Full delivery instruction passed to providers that accept one.
    pub fn instructions(&self) -> String {
        let mut text = self.style.delivery().to_string();
        if let Some(bpm) = self.bpm {
            text.push_str(&format!(
                ". Delivery: {} at {} BPM {} style",
                self.tempo_description(),
                bpm,
                self.beat_style.display_name()
            ));
        }
        if self.finale {
            text.push_str(". Build to a knockout finish");
        }
        text
    }

    /// Speaking-rate multiplier for engines without instruction support.
    pub fn speed(&self) -> f32 {
        match self.bpm {
            Some(bpm) if bpm < 90 => 0.95,
            Some(bpm) if bpm >= 150 => 1.15,
            Some(bpm) if bpm >= 120 => 1.05,
            _ => 1.0,
        }
    }
}

/// A voice synthesis backend.
#[async_trait]
pub trait VoiceProvider: Send + Sync {
    fn name(&self) -> &str;

    fn tier(&self) -> ProviderTier;

    /// Cheap availability check. Must not synthesize anything.
    async fn is_available(&self) -> bool;

    /// Create a voice from a participant's sample.
    async fn clone_voice(
        &self,
        speaker: Speaker,
        sample: &VoiceSample,
    ) -> Result<VoiceHandle, ProviderError>;

    /// Built-in voice for a delivery style.
    fn preset_voice(&self, style: DeliveryStyle) -> VoiceHandle;

    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceHandle,
        hints: &StyleHints,
    ) -> Result<AudioClip, ProviderError>;
}

impl fmt::Debug for dyn VoiceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceProvider")
            .field("name", &self.name())
            .field("tier", &self.tier())
            .finish()
    }
}

/// Bind the first available provider in priority order.
///
/// Providers after the selected one are never queried.
pub async fn select_voice_provider(
    providers: &[Arc<dyn VoiceProvider>],
) -> Result<Arc<dyn VoiceProvider>, BattleError> {
    let mut tried = Vec::with_capacity(providers.len());
    for provider in providers {
        tried.push(provider.name().to_string());
        if provider.is_available().await {
            info!(provider = provider.name(), tier = ?provider.tier(), "voice provider selected");
            return Ok(Arc::clone(provider));
        }
        debug!(provider = provider.name(), "voice provider unavailable");
    }
    Err(BattleError::NoProviderAvailable { tried })
}

/// The provider bound to one battle plus its per-speaker voices.
///
/// Each speaker's voice is resolved at most once, even when several verses of
/// the same speaker ask for it concurrently.
pub struct VoiceBinding {
    provider: Arc<dyn VoiceProvider>,
    voices: HashMap<Speaker, Arc<OnceCell<VoiceHandle>>>,
    clone_timeout: Duration,
}

impl VoiceBinding {
    pub fn new(provider: Arc<dyn VoiceProvider>, clone_timeout: Duration) -> Self {
        let voices = Speaker::BOTH
            .into_iter()
            .map(|speaker| (speaker, Arc::new(OnceCell::new())))
            .collect();
        Self {
            provider,
            voices,
            clone_timeout,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Voice for `speaker`, cloning from `sample` on first use when present.
    pub async fn voice(
        &self,
        speaker: Speaker,
        participant: &ParticipantInput,
        sample: Option<&VoiceSample>,
    ) -> Result<VoiceHandle, StageFailure> {
        let cell = self
            .voices
            .get(&speaker)
            .map(Arc::clone)
            .unwrap_or_default();

        let handle = cell
            .get_or_try_init(|| async {
                match sample {
                    Some(sample) => {
                        debug!(%speaker, provider = self.provider.name(), "cloning voice");
                        let cloned = tokio::time::timeout(
                            self.clone_timeout,
                            self.provider.clone_voice(speaker, sample),
                        )
                        .await;
                        match cloned {
                            Ok(result) => result.map_err(StageFailure::from),
                            Err(_) => Err(StageFailure::Timeout {
                                operation: "voice cloning",
                                after: self.clone_timeout,
                            }),
                        }
                    }
                    None => Ok(self.provider.preset_voice(participant.style)),
                }
            })
            .await?;

        Ok(handle.clone())
    }

    /// Voice already resolved for `speaker`, if any.
    pub fn resolved(&self, speaker: Speaker) -> Option<VoiceHandle> {
        self.voices.get(&speaker).and_then(|cell| cell.get().cloned())
    }

    pub async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceHandle,
        hints: &StyleHints,
        timeout: Duration,
    ) -> Result<AudioClip, StageFailure> {
        tokio::time::timeout(timeout, self.provider.synthesize(text, voice, hints))
            .await
            .map_err(|_| StageFailure::Timeout {
                operation: "voice synthesis",
                after: timeout,
            })?
            .map_err(StageFailure::from)
    }
}

/// A lyric generation backend.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &VersePrompt) -> Result<String, ProviderError>;
}

/// A talking-head lip-sync backend.
#[async_trait]
pub trait LipSyncProvider: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool;

    /// Render `face_url` speaking `audio_url`; returns the video URL.
    async fn lipsync(&self, face_url: &str, audio_url: &str) -> Result<String, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        name: &'static str,
        available: bool,
        availability_checks: AtomicUsize,
        clones: AtomicUsize,
    }

    impl CountingProvider {
        fn new(name: &'static str, available: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                available,
                availability_checks: AtomicUsize::new(0),
                clones: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl VoiceProvider for CountingProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn tier(&self) -> ProviderTier {
            ProviderTier::Primary
        }

        async fn is_available(&self) -> bool {
            self.availability_checks.fetch_add(1, Ordering::SeqCst);
            self.available
        }

        async fn clone_voice(
            &self,
            speaker: Speaker,
            _sample: &VoiceSample,
        ) -> Result<VoiceHandle, ProviderError> {
            self.clones.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(VoiceHandle {
                provider: self.name.to_string(),
                voice_id: format!("clone-{}", speaker),
                cloned: true,
            })
        }

        fn preset_voice(&self, style: DeliveryStyle) -> VoiceHandle {
            VoiceHandle::preset(self.name, style.key())
        }

        async fn synthesize(
            &self,
            _text: &str,
            _voice: &VoiceHandle,
            _hints: &StyleHints,
        ) -> Result<AudioClip, ProviderError> {
            Ok(AudioClip::new(vec![0.0; 10], 10))
        }
    }

    #[tokio::test]
    async fn test_selection_stops_at_first_available() {
        let primary = CountingProvider::new("primary", true);
        let fallback = CountingProvider::new("fallback", true);
        let providers: Vec<Arc<dyn VoiceProvider>> = vec![primary.clone(), fallback.clone()];

        let selected = select_voice_provider(&providers).await.unwrap();
        assert_eq!(selected.name(), "primary");
        assert_eq!(fallback.availability_checks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_selection_reports_every_tried_provider() {
        let providers: Vec<Arc<dyn VoiceProvider>> = vec![
            CountingProvider::new("primary", false),
            CountingProvider::new("fallback", false),
        ];
        let err = select_voice_provider(&providers).await.unwrap_err();
        match err {
            BattleError::NoProviderAvailable { tried } => {
                assert_eq!(tried, vec!["primary", "fallback"])
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_first_use_clones_once() {
        let provider = CountingProvider::new("primary", true);
        let binding = VoiceBinding::new(provider.clone(), Duration::from_secs(5));
        let participant = ParticipantInput::new("Nova", DeliveryStyle::Grime);
        let sample = VoiceSample {
            path: PathBuf::from("nova.wav"),
            name: "Nova".to_string(),
            bytes: vec![1, 2, 3],
        };

        let calls = (0..5).map(|_| binding.voice(Speaker::A, &participant, Some(&sample)));
        let handles = futures::future::try_join_all(calls).await.unwrap();

        assert_eq!(provider.clones.load(Ordering::SeqCst), 1);
        assert!(handles.iter().all(|h| h.voice_id == "clone-A" && h.cloned));
        assert_eq!(binding.resolved(Speaker::A), Some(handles[0].clone()));
        assert_eq!(binding.resolved(Speaker::B), None);
    }

    #[tokio::test]
    async fn test_no_sample_uses_style_preset() {
        let provider = CountingProvider::new("primary", true);
        let binding = VoiceBinding::new(provider.clone(), Duration::from_secs(5));
        let participant = ParticipantInput::new("Orbit", DeliveryStyle::Drill);
        let handle = binding.voice(Speaker::B, &participant, None).await.unwrap();
        assert_eq!(handle.voice_id, "drill");
        assert!(!handle.cloned);
        assert_eq!(provider.clones.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_tempo_bands() {
        let hints = |bpm| StyleHints {
            style: DeliveryStyle::Grime,
            beat_style: BeatStyle::Trap,
            bpm: Some(bpm),
            finale: false,
        };
        assert_eq!(hints(85).tempo_description(), "slow, deliberate");
        assert_eq!(hints(95).tempo_description(), "moderate groove");
        assert_eq!(hints(140).tempo_description(), "energetic, punchy");
        assert_eq!(hints(160).tempo_description(), "rapid-fire, intense");
        assert!(hints(140).instructions().contains("energetic, punchy at 140 BPM trap style"));
    }
}
