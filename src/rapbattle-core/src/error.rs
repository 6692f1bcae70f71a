//! Error types for the battle pipeline.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stage::StageId;

/// Errors raised by external providers (voice, text, lip-sync).
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider '{provider}' is unavailable: {reason}")]
    Unavailable { provider: String, reason: String },

    #[error("synthesis failed in '{provider}': {source}")]
    SynthesisFailed {
        provider: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("generation failed in '{provider}': {detail}")]
    GenerationFailed { provider: String, detail: String },

    #[error("provider '{provider}' returned an empty response")]
    EmptyResponse { provider: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("OpenAI API error: {0}")]
    OpenAI(#[from] async_openai::error::OpenAIError),
}

impl ProviderError {
    pub fn synthesis(
        provider: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        ProviderError::SynthesisFailed {
            provider: provider.into(),
            source: source.into(),
        }
    }
}

/// Errors from audio decoding, encoding and artifact storage.
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audio clip is empty: {0}")]
    Empty(String),

    #[error("unsupported audio format: {0}")]
    Unsupported(String),
}

/// Errors from the timing aligner.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignError {
    #[error("no verses to align")]
    NoVerses,

    #[error("track duration must be positive, got {0}")]
    InvalidTrackDuration(f64),

    #[error("timing invariant violated: {0}")]
    Invariant(String),
}

/// The underlying cause of a failed stage.
#[derive(Error, Debug)]
pub enum StageFailure {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Align(#[from] AlignError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Errors surfaced by the orchestrator.
#[derive(Error, Debug)]
pub enum BattleError {
    #[error("invalid battle request: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("no voice provider available (tried: {})", .tried.join(", "))]
    NoProviderAvailable { tried: Vec<String> },

    #[error("stage '{stage}' failed: {cause}")]
    StageFailed {
        stage: StageId,
        #[source]
        cause: StageFailure,
    },

    #[error("battle was cancelled")]
    Cancelled,

    #[error("unknown battle: {0}")]
    UnknownBattle(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BattleError {
    /// Machine-readable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BattleError::Validation(_) => ErrorKind::Validation,
            BattleError::NoProviderAvailable { .. } => ErrorKind::NoProviderAvailable,
            BattleError::StageFailed {
                cause: StageFailure::Timeout { .. },
                ..
            } => ErrorKind::Timeout,
            BattleError::StageFailed { .. } => ErrorKind::StageFailed,
            BattleError::Cancelled => ErrorKind::Cancelled,
            BattleError::UnknownBattle(_) => ErrorKind::NotFound,
            BattleError::Config(_) => ErrorKind::Config,
        }
    }

    /// The stage that failed, if the error is tied to one.
    ///
    /// Provider selection runs ahead of the stage table on behalf of voice
    /// preparation, so a missing provider is reported against that stage.
    pub fn stage(&self) -> Option<StageId> {
        match self {
            BattleError::StageFailed { stage, .. } => Some(*stage),
            BattleError::NoProviderAvailable { .. } => Some(StageId::VoicePrep),
            _ => None,
        }
    }

    /// Field-level messages for validation errors.
    pub fn field_errors(&self) -> &[String] {
        match self {
            BattleError::Validation(errors) => errors,
            _ => &[],
        }
    }
}

/// Serializable error kind carried in progress updates and HTTP responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NoProviderAvailable,
    StageFailed,
    Timeout,
    Cancelled,
    NotFound,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NoProviderAvailable => "no_provider_available",
            ErrorKind::StageFailed => "stage_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Config => "config",
        }
    }
}
