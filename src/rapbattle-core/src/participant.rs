//! Battle participant definitions.
//!
//! Represents the two rappers in a battle, their delivery style and the
//! optional reference media used for voice cloning and lip-sync.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which side of the battle a participant is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Speaker {
    A,
    B,
}

impl Speaker {
    pub const BOTH: [Speaker; 2] = [Speaker::A, Speaker::B];

    pub fn opponent(self) -> Speaker {
        match self {
            Speaker::A => Speaker::B,
            Speaker::B => Speaker::A,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Speaker::A => "A",
            Speaker::B => "B",
        }
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Delivery style of a rapper. Each style maps to a preset voice per provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStyle {
    Grime,
    EastCoast,
    WestCoast,
    Melodic,
    Drill,
}

impl DeliveryStyle {
    pub const ALL: [DeliveryStyle; 5] = [
        DeliveryStyle::Grime,
        DeliveryStyle::EastCoast,
        DeliveryStyle::WestCoast,
        DeliveryStyle::Melodic,
        DeliveryStyle::Drill,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            DeliveryStyle::Grime => "grime",
            DeliveryStyle::EastCoast => "east_coast",
            DeliveryStyle::WestCoast => "west_coast",
            DeliveryStyle::Melodic => "melodic",
            DeliveryStyle::Drill => "drill",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            DeliveryStyle::Grime => "UK Grime",
            DeliveryStyle::EastCoast => "East Coast",
            DeliveryStyle::WestCoast => "West Coast",
            DeliveryStyle::Melodic => "Melodic",
            DeliveryStyle::Drill => "Drill",
        }
    }

    /// Short delivery description fed to voice providers.
    pub fn delivery(&self) -> &'static str {
        match self {
            DeliveryStyle::Grime => "fast, clipped UK grime flow with hard consonants",
            DeliveryStyle::EastCoast => "gritty east coast flow, punchy and lyrical",
            DeliveryStyle::WestCoast => "laid-back west coast delivery with a smooth bounce",
            DeliveryStyle::Melodic => "melodic, half-sung cadence",
            DeliveryStyle::Drill => "menacing drill delivery, staccato and low",
        }
    }
}

impl FromStr for DeliveryStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        DeliveryStyle::ALL
            .into_iter()
            .find(|style| style.key() == normalized)
            .ok_or_else(|| format!("unknown delivery style '{}'", s))
    }
}

/// One battle participant as submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInput {
    /// Display name, must be non-empty.
    pub name: String,
    pub style: DeliveryStyle,
    /// Free-form description used as prompt context.
    #[serde(default)]
    pub description: Option<String>,
    /// Audio sample used to clone this participant's voice.
    #[serde(default)]
    pub voice_sample: Option<PathBuf>,
    /// Publicly reachable face image or video used for lip-sync.
    #[serde(default)]
    pub face_reference: Option<String>,
    /// Pre-written lyrics, verses separated by blank lines.
    #[serde(default)]
    pub lyrics: Option<String>,
}

impl ParticipantInput {
    /// Create a participant with the given name and style.
    pub fn new(name: impl Into<String>, style: DeliveryStyle) -> Self {
        Self {
            name: name.into(),
            style,
            description: None,
            voice_sample: None,
            face_reference: None,
            lyrics: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_voice_sample(mut self, path: impl Into<PathBuf>) -> Self {
        self.voice_sample = Some(path.into());
        self
    }

    pub fn with_face(mut self, reference: impl Into<String>) -> Self {
        self.face_reference = Some(reference.into());
        self
    }

    pub fn with_lyrics(mut self, lyrics: impl Into<String>) -> Self {
        self.lyrics = Some(lyrics.into());
        self
    }

    /// True when usable pre-written lyrics were supplied.
    pub fn has_lyrics(&self) -> bool {
        self.lyrics.as_deref().is_some_and(|l| !l.trim().is_empty())
    }

    /// Get the full display name with style.
    pub fn display_name_with_style(&self) -> String {
        format!("{} ({})", self.name, self.style.display_name())
    }
}
