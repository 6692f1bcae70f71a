//! RapBattle Core Library
//!
//! Provides the battle pipeline: provider adapters with fallback, audio
//! analysis, lyric timing, the stage runner and the battle orchestrator with
//! its progress channel.

pub mod analyzer;
pub mod audio;
pub mod battle;
pub mod beat;
pub mod config;
pub mod error;
pub mod lyrics;
pub mod mixer;
pub mod orchestrator;
pub mod participant;
pub mod progress;
pub mod provider;
pub mod stage;
pub mod timing;
mod worker;

pub use audio::{ArtifactStore, AudioClip, PIPELINE_SAMPLE_RATE, UploadKind};
pub use battle::{
    ArtifactBundle, BattleId, BattleRequest, BattleState, BattleStatus, BeatStyle,
    CompletionPayload, ErrorReport, Verse,
};
pub use config::{Config, default_config};
pub use error::{AlignError, AudioError, BattleError, ErrorKind, ProviderError, StageFailure};
pub use orchestrator::{BattleOrchestrator, Credentials, ProviderSet};
pub use participant::{DeliveryStyle, ParticipantInput, Speaker};
pub use progress::{ProgressChannel, ProgressSubscription, ProgressUpdate};
pub use provider::{LipSyncProvider, ProviderTier, StyleHints, TextGenerator, VoiceHandle, VoiceProvider, VoiceSample};
pub use stage::{StageId, StageResult, StageStatus};
pub use timing::{BarTiming, TimingLine};
