//! Configuration module for loading TOML config files.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::BattleError;
use crate::participant::DeliveryStyle;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub text: TextConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
}

/// Pipeline-wide settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub output_dir: PathBuf,
    pub waveform_resolution: usize,
    pub min_line_secs: f64,
    pub verse_gap_secs: f64,
    pub beat_gain_db: f32,
    /// How long terminal battles stay queryable.
    pub retention_secs: u64,
    /// Per-subscriber buffer before updates are dropped for that subscriber.
    pub progress_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("outputs"),
            waveform_resolution: 200,
            min_line_secs: crate::timing::DEFAULT_MIN_LINE_SECS,
            verse_gap_secs: 0.25,
            beat_gain_db: -10.0,
            retention_secs: 3600,
            progress_capacity: 64,
        }
    }
}

impl PipelineConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Per-call timeouts for provider operations, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub text_secs: u64,
    pub voice_secs: u64,
    pub clone_secs: u64,
    pub video_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            text_secs: 60,
            voice_secs: 120,
            clone_secs: 60,
            video_secs: 900,
        }
    }
}

impl TimeoutsConfig {
    pub fn text(&self) -> Duration {
        Duration::from_secs(self.text_secs)
    }

    pub fn voice(&self) -> Duration {
        Duration::from_secs(self.voice_secs)
    }

    pub fn voice_clone(&self) -> Duration {
        Duration::from_secs(self.clone_secs)
    }

    pub fn video(&self) -> Duration {
        Duration::from_secs(self.video_secs)
    }
}

/// Lyric generation settings (OpenAI-compatible chat API).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TextConfig {
    pub api_base: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub accept_invalid_certs: bool,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 1000,
            temperature: 0.8,
            accept_invalid_certs: false,
        }
    }
}

/// Voice provider settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Hosted voice API base URL (primary provider).
    pub hosted_base_url: String,
    pub hosted_model: String,
    /// Hosted preset voice id per delivery style key.
    pub hosted_presets: HashMap<String, String>,
    /// Local kokoro voice id per delivery style key (fallback provider).
    pub local_presets: HashMap<String, String>,
    pub local_default_voice: String,
    /// Disable the local fallback provider.
    pub disable_local: bool,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        let local = [
            (DeliveryStyle::Grime, "bm_george"),
            (DeliveryStyle::EastCoast, "am_michael"),
            (DeliveryStyle::WestCoast, "am_adam"),
            (DeliveryStyle::Melodic, "af_sky"),
            (DeliveryStyle::Drill, "bm_lewis"),
        ];
        Self {
            hosted_base_url: "https://api.elevenlabs.io/v1".to_string(),
            hosted_model: "eleven_multilingual_v2".to_string(),
            hosted_presets: HashMap::new(),
            local_presets: local
                .into_iter()
                .map(|(style, voice)| (style.key().to_string(), voice.to_string()))
                .collect(),
            local_default_voice: "am_adam".to_string(),
            disable_local: false,
        }
    }
}

impl VoiceConfig {
    pub fn local_voice(&self, style: DeliveryStyle) -> &str {
        self.local_presets
            .get(style.key())
            .map(String::as_str)
            .unwrap_or(&self.local_default_voice)
    }
}

/// Lip-sync provider settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub base_url: String,
    pub model: String,
    pub poll_interval_secs: u64,
    /// Public URL under which `/outputs/` artifacts are reachable by the
    /// lip-sync service. Video is skipped when unset.
    pub public_base_url: Option<String>,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.sync.so/v2".to_string(),
            model: "lipsync-2".to_string(),
            poll_interval_secs: 10,
            public_base_url: None,
        }
    }
}

/// Prompt templates.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptsConfig {
    pub system_prompt: String,
    pub verse_template: String,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            verse_template: DEFAULT_VERSE_TEMPLATE.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, BattleError> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| BattleError::Config(format!("Failed to read config: {}", e)))?;

        Self::from_str(&content)
    }

    /// Load configuration from string content.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, BattleError> {
        let config: Config = toml::from_str(content)
            .map_err(|e| BattleError::Config(format!("Failed to parse config: {}", e)))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), BattleError> {
        if self.pipeline.waveform_resolution == 0 {
            return Err(BattleError::Config(
                "pipeline.waveform_resolution must be at least 1".to_string(),
            ));
        }
        if self.pipeline.progress_capacity == 0 {
            return Err(BattleError::Config(
                "pipeline.progress_capacity must be at least 1".to_string(),
            ));
        }
        let min_line = self.pipeline.min_line_secs;
        if !min_line.is_finite() || min_line <= 0.0 {
            return Err(BattleError::Config(
                "pipeline.min_line_secs must be greater than zero".to_string(),
            ));
        }
        if self.pipeline.verse_gap_secs < 0.0 {
            return Err(BattleError::Config(
                "pipeline.verse_gap_secs must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default configuration embedded in the binary.
pub fn default_config() -> Config {
    Config {
        pipeline: PipelineConfig::default(),
        timeouts: TimeoutsConfig::default(),
        text: TextConfig::default(),
        voice: VoiceConfig::default(),
        video: VideoConfig::default(),
        prompts: PromptsConfig::default(),
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are a legendary battle rapper known for devastating punchlines, clever wordplay, and authentic flow. You never break character.";

const DEFAULT_VERSE_TEMPLATE: &str = r#"BATTLE TOPIC: {topic}
{description}
{beat_context}

CURRENT RAPPER: {rapper_name} ({rapper_style})
OPPONENT: {opponent_name}

ATMOSPHERE: {scene}

VERSE NUMBER: {verse_number} of {verse_total}
{verse_context}

{previous_verses}

INSTRUCTIONS:
1. Write a SHORT verse (4-6 bars, ~15 seconds when rapped) for {rapper_name}
2. Each bar should be on its own line
3. Use clever wordplay, metaphors, and punchlines
4. Focus lyrics on the BATTLE TOPIC and dissing your OPPONENT
5. {verse_instruction}
6. Include internal rhymes and multisyllabic rhyme schemes
7. Match your flow and cadence to the beat style and tempo

OUTPUT FORMAT: Return ONLY the verse lyrics, one bar per line. No explanations, no labels, just the raw lyrics."#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config.pipeline.waveform_resolution, 200);
        assert_eq!(config.timeouts.video(), Duration::from_secs(900));
        assert!(config.prompts.verse_template.contains("{rapper_name}"));
    }

    #[test]
    fn test_partial_override() {
        let config = Config::from_str(
            r#"
            [pipeline]
            waveform_resolution = 128
            verse_gap_secs = 0.0

            [voice.local_presets]
            grime = "bm_daniel"
            "#,
        )
        .unwrap();
        assert_eq!(config.pipeline.waveform_resolution, 128);
        assert_eq!(config.pipeline.min_line_secs, 0.5);
        assert_eq!(config.voice.local_voice(DeliveryStyle::Grime), "bm_daniel");
        assert_eq!(config.voice.local_voice(DeliveryStyle::Drill), "am_adam");
    }

    #[test]
    fn test_rejects_zero_resolution() {
        let err = Config::from_str("[pipeline]\nwaveform_resolution = 0").unwrap_err();
        assert!(err.to_string().contains("waveform_resolution"));
    }

    #[test]
    fn test_rejects_non_positive_min_line() {
        for value in ["0.0", "-0.5"] {
            let err = Config::from_str(&format!("[pipeline]\nmin_line_secs = {}", value)).unwrap_err();
            assert!(err.to_string().contains("min_line_secs"));
        }
        assert!(Config::from_str("[pipeline]\nmin_line_secs = 0.1").is_ok());
    }

    #[test]
    fn test_default_local_voices() {
        let config = default_config();
        assert_eq!(config.voice.local_voice(DeliveryStyle::Grime), "bm_george");
    }
}
