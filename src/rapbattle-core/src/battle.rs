//! Battle request, state and artifact bundle.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BattleError, ErrorKind};
use crate::participant::{ParticipantInput, Speaker};
use crate::stage::{StageId, StageResult};
use crate::timing::{BarTiming, TimingLine};

/// Unique identifier of a battle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BattleId(Uuid);

impl BattleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, used in artifact file names.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for BattleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BattleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BattleId {
    type Err = BattleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| BattleError::UnknownBattle(s.to_string()))
    }
}

/// Beat style of the instrumental.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeatStyle {
    Trap,
    BoomBap,
    WestCoast,
    Drill,
}

impl BeatStyle {
    pub const ALL: [BeatStyle; 4] = [
        BeatStyle::Trap,
        BeatStyle::BoomBap,
        BeatStyle::WestCoast,
        BeatStyle::Drill,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            BeatStyle::Trap => "trap",
            BeatStyle::BoomBap => "boom_bap",
            BeatStyle::WestCoast => "west_coast",
            BeatStyle::Drill => "drill",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            BeatStyle::Trap => "trap",
            BeatStyle::BoomBap => "boom bap",
            BeatStyle::WestCoast => "west coast",
            BeatStyle::Drill => "drill",
        }
    }

    /// Tempo used when neither a hint nor a detected tempo is available.
    pub fn default_bpm(&self) -> u32 {
        match self {
            BeatStyle::Trap => 140,
            BeatStyle::BoomBap => 90,
            BeatStyle::WestCoast => 95,
            BeatStyle::Drill => 145,
        }
    }
}

impl FromStr for BeatStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        BeatStyle::ALL
            .into_iter()
            .find(|style| style.key() == normalized)
            .ok_or_else(|| format!("unknown beat style '{}'", s))
    }
}

fn default_verse_count() -> usize {
    2
}

fn default_true() -> bool {
    true
}

/// A request to generate one battle. Immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleRequest {
    pub fighter_a: ParticipantInput,
    pub fighter_b: ParticipantInput,
    pub topic: String,
    #[serde(default)]
    pub scene: Option<String>,
    pub beat_style: BeatStyle,
    /// Target tempo hint; the detected tempo of the final mix is authoritative.
    #[serde(default)]
    pub bpm_hint: Option<u32>,
    /// Verses per participant.
    #[serde(default = "default_verse_count")]
    pub verse_count: usize,
    #[serde(default = "default_true")]
    pub audio_only: bool,
    /// Cheap run: one verse per participant and no video.
    #[serde(default)]
    pub test_mode: bool,
}

pub const MAX_VERSES_PER_PARTICIPANT: usize = 8;

impl BattleRequest {
    pub fn new(
        fighter_a: ParticipantInput,
        fighter_b: ParticipantInput,
        topic: impl Into<String>,
        beat_style: BeatStyle,
    ) -> Self {
        Self {
            fighter_a,
            fighter_b,
            topic: topic.into(),
            scene: None,
            beat_style,
            bpm_hint: None,
            verse_count: default_verse_count(),
            audio_only: true,
            test_mode: false,
        }
    }

    pub fn with_verse_count(mut self, verse_count: usize) -> Self {
        self.verse_count = verse_count;
        self
    }

    pub fn with_video(mut self) -> Self {
        self.audio_only = false;
        self
    }

    pub fn participant(&self, speaker: Speaker) -> &ParticipantInput {
        match speaker {
            Speaker::A => &self.fighter_a,
            Speaker::B => &self.fighter_b,
        }
    }

    /// Verses each participant performs after applying test mode.
    pub fn effective_verse_count(&self) -> usize {
        if self.test_mode { 1 } else { self.verse_count }
    }

    /// True when both participants supplied their own lyrics.
    pub fn all_lyrics_provided(&self) -> bool {
        self.fighter_a.has_lyrics() && self.fighter_b.has_lyrics()
    }

    /// Synchronous field validation. Returns every problem found.
    pub fn validate(&self) -> Result<(), BattleError> {
        let mut errors = Vec::new();

        for speaker in Speaker::BOTH {
            let field = field_name(speaker);
            let participant = self.participant(speaker);
            if participant.name.trim().is_empty() {
                errors.push(format!("{}.name must not be empty", field));
            }
            if let Some(lyrics) = participant.lyrics.as_deref().filter(|l| !l.trim().is_empty()) {
                let blocks = crate::lyrics::split_verses(lyrics).len();
                if blocks < self.effective_verse_count() {
                    errors.push(format!(
                        "{}.lyrics contains {} verse(s) but {} are required",
                        field,
                        blocks,
                        self.effective_verse_count()
                    ));
                }
            }
        }

        if self.topic.trim().is_empty() && !self.all_lyrics_provided() {
            errors.push("topic must not be empty when lyrics are generated".to_string());
        }
        if self.verse_count == 0 || self.verse_count > MAX_VERSES_PER_PARTICIPANT {
            errors.push(format!(
                "verse_count must be between 1 and {}",
                MAX_VERSES_PER_PARTICIPANT
            ));
        }
        if let Some(bpm) = self.bpm_hint.filter(|bpm| !(40..=220).contains(bpm)) {
            errors.push(format!("bpm_hint must be between 40 and 220, got {}", bpm));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(BattleError::Validation(errors))
        }
    }
}

fn field_name(speaker: Speaker) -> &'static str {
    match speaker {
        Speaker::A => "fighter_a",
        Speaker::B => "fighter_b",
    }
}

/// One speaker's turn of lyric text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verse {
    pub speaker: Speaker,
    /// 1-based position in the battle.
    pub sequence: usize,
    pub text: String,
    /// Last verse of this speaker.
    pub finale: bool,
}

/// Lifecycle status of a battle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BattleStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
    Cancelled,
}

impl BattleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BattleStatus::Complete | BattleStatus::Failed | BattleStatus::Cancelled
        )
    }
}

/// Reference to one synthesized verse clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceClipRef {
    pub sequence: usize,
    pub speaker: Speaker,
    pub path: String,
    pub duration_secs: f64,
}

/// Artifacts produced across stages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactBundle {
    pub verses: Vec<Verse>,
    pub voice_clips: Vec<VoiceClipRef>,
    pub beat: Option<String>,
    /// Tempo the beat was generated at.
    pub beat_bpm: Option<u32>,
    pub mixed_audio: Option<String>,
    pub mixed_duration_secs: Option<f64>,
    /// Tempo detected on the final mix.
    pub detected_bpm: Option<f32>,
    pub timing: Vec<TimingLine>,
    /// Per-line timing inside each verse interval.
    pub bars: Vec<BarTiming>,
    pub waveform: Vec<f32>,
    pub talking_heads: BTreeMap<Speaker, String>,
}

/// Why a battle did not complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub stage: Option<StageId>,
    pub message: String,
}

impl From<&BattleError> for ErrorReport {
    fn from(err: &BattleError) -> Self {
        Self {
            kind: err.kind(),
            stage: err.stage(),
            message: err.to_string(),
        }
    }
}

/// Snapshot of a battle's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleState {
    pub battle_id: BattleId,
    pub request: BattleRequest,
    pub status: BattleStatus,
    pub stage: Option<StageId>,
    pub progress: f32,
    pub message: String,
    pub stages: Vec<StageResult>,
    pub artifacts: ArtifactBundle,
    pub error: Option<ErrorReport>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BattleState {
    pub fn new(battle_id: BattleId, request: BattleRequest) -> Self {
        Self {
            battle_id,
            request,
            status: BattleStatus::Pending,
            stage: None,
            progress: 0.0,
            message: "Battle queued".to_string(),
            stages: Vec::new(),
            artifacts: ArtifactBundle::default(),
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn stage_result(&self, stage: StageId) -> Option<&StageResult> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    /// Completion payload, present once the battle is complete.
    pub fn completion(&self) -> Option<CompletionPayload> {
        if self.status != BattleStatus::Complete {
            return None;
        }
        Some(CompletionPayload {
            audio_url: crate::audio::artifact_url(self.artifacts.mixed_audio.as_deref()?),
            detected_bpm: self.artifacts.detected_bpm,
            timing: self.artifacts.timing.clone(),
            bars: self.artifacts.bars.clone(),
            waveform: self.artifacts.waveform.clone(),
            talking_heads: self.artifacts.talking_heads.clone(),
        })
    }
}

/// Everything a playback surface needs once a battle completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionPayload {
    pub audio_url: String,
    pub detected_bpm: Option<f32>,
    pub timing: Vec<TimingLine>,
    pub bars: Vec<BarTiming>,
    pub waveform: Vec<f32>,
    pub talking_heads: BTreeMap<Speaker, String>,
}
