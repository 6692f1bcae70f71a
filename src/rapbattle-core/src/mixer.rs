//! Vocal and beat mixing.

use crate::audio::AudioClip;
use crate::error::AudioError;

/// Mixing parameters.
#[derive(Debug, Clone, Copy)]
pub struct MixSettings {
    /// Silence inserted between consecutive verses.
    pub verse_gap_secs: f64,
    /// Beat level relative to the vocals, in dB.
    pub beat_gain_db: f32,
}

impl Default for MixSettings {
    fn default() -> Self {
        Self {
            verse_gap_secs: 0.25,
            beat_gain_db: -10.0,
        }
    }
}

pub fn db_to_gain(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Concatenate verse clips in order, then overlay them on the beat.
///
/// The beat is looped or trimmed to the vocal length. All clips must already
/// share the beat's sample rate.
pub fn mix(vocals: &[AudioClip], beat: &AudioClip, settings: &MixSettings) -> Result<AudioClip, AudioError> {
    if vocals.iter().all(AudioClip::is_empty) {
        return Err(AudioError::Empty("no vocal audio to mix".to_string()));
    }
    if let Some(clip) = vocals.iter().find(|c| c.sample_rate != beat.sample_rate) {
        return Err(AudioError::Unsupported(format!(
            "vocal sample rate {} does not match beat sample rate {}",
            clip.sample_rate, beat.sample_rate
        )));
    }

    let vocal_track = AudioClip::concat(vocals, settings.verse_gap_secs, beat.sample_rate);
    let gain = db_to_gain(settings.beat_gain_db);

    let samples = if beat.is_empty() {
        vocal_track.samples.iter().map(|s| s.clamp(-1.0, 1.0)).collect()
    } else {
        vocal_track
            .samples
            .iter()
            .zip(beat.samples.iter().cycle())
            .map(|(v, b)| (v + b * gain).clamp(-1.0, 1.0))
            .collect()
    };

    Ok(AudioClip::new(samples, beat.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mix_length_includes_gaps() {
        let vocals = vec![AudioClip::new(vec![0.1; 100], 100), AudioClip::new(vec![0.1; 50], 100)];
        let beat = AudioClip::new(vec![0.0; 30], 100);
        let settings = MixSettings { verse_gap_secs: 0.5, beat_gain_db: -10.0 };
        let mixed = mix(&vocals, &beat, &settings).unwrap();
        assert_eq!(mixed.samples.len(), 200);
        assert!((mixed.duration_secs() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_beat_is_looped_and_attenuated() {
        let vocals = vec![AudioClip::new(vec![0.0; 10], 10)];
        let beat = AudioClip::new(vec![1.0, 0.0], 10);
        let settings = MixSettings { verse_gap_secs: 0.0, beat_gain_db: -20.0 };
        let mixed = mix(&vocals, &beat, &settings).unwrap();
        assert!((mixed.samples[0] - 0.1).abs() < 1e-6);
        assert_eq!(mixed.samples[1], 0.0);
        assert!((mixed.samples[8] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_output_is_clamped() {
        let vocals = vec![AudioClip::new(vec![0.95; 4], 10)];
        let beat = AudioClip::new(vec![1.0; 4], 10);
        let mixed = mix(&vocals, &beat, &MixSettings { verse_gap_secs: 0.0, beat_gain_db: 0.0 }).unwrap();
        assert!(mixed.samples.iter().all(|s| *s <= 1.0));
    }

    #[test]
    fn test_rejects_empty_vocals_and_mismatched_rates() {
        let beat = AudioClip::new(vec![0.0; 4], 10);
        assert!(mix(&[AudioClip::new(vec![], 10)], &beat, &MixSettings::default()).is_err());
        assert!(mix(&[AudioClip::new(vec![0.1], 20)], &beat, &MixSettings::default()).is_err());
    }
}
