//! Procedural drum beats.
//!
//! Each style is a one-bar, sixteen-step pattern of kick, snare, clap and
//! hi-hat hits rendered from simple synthesized voices and looped to cover
//! the requested duration.

use crate::audio::AudioClip;
use crate::battle::BeatStyle;

const STEPS_PER_BAR: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drum {
    Kick,
    Snare,
    Clap,
    HiHat,
    OpenHat,
}

/// A sixteen-step pattern; each step lists the drums that fire on it.
struct Pattern {
    steps: [&'static [Drum]; STEPS_PER_BAR],
}

use Drum::{Clap, HiHat, Kick, OpenHat, Snare};

const TRAP: Pattern = Pattern {
    steps: [
        &[Kick, HiHat], &[HiHat], &[HiHat], &[HiHat],
        &[HiHat], &[HiHat], &[Kick, HiHat], &[HiHat],
        &[Snare, Clap, HiHat], &[HiHat], &[HiHat], &[Kick, HiHat],
        &[HiHat], &[HiHat], &[OpenHat], &[HiHat],
    ],
};

const BOOM_BAP: Pattern = Pattern {
    steps: [
        &[Kick, HiHat], &[], &[HiHat], &[],
        &[Snare, HiHat], &[], &[HiHat], &[Kick],
        &[Kick, HiHat], &[], &[HiHat], &[],
        &[Snare, HiHat], &[], &[HiHat], &[],
    ],
};

const WEST_COAST: Pattern = Pattern {
    steps: [
        &[Kick, HiHat], &[], &[HiHat], &[Kick],
        &[Clap, HiHat], &[], &[OpenHat], &[],
        &[HiHat], &[Kick], &[Kick, HiHat], &[],
        &[Clap, HiHat], &[], &[OpenHat], &[],
    ],
};

const DRILL: Pattern = Pattern {
    steps: [
        &[Kick, HiHat], &[], &[], &[HiHat],
        &[HiHat], &[], &[Kick, HiHat], &[],
        &[Snare, Clap], &[HiHat], &[], &[HiHat],
        &[Kick], &[HiHat], &[Snare], &[HiHat],
    ],
};

fn pattern(style: BeatStyle) -> &'static Pattern {
    match style {
        BeatStyle::Trap => &TRAP,
        BeatStyle::BoomBap => &BOOM_BAP,
        BeatStyle::WestCoast => &WEST_COAST,
        BeatStyle::Drill => &DRILL,
    }
}

/// Render a beat of `style` at `bpm`, looped and trimmed to `duration_secs`.
pub fn generate(style: BeatStyle, bpm: u32, duration_secs: f64, sample_rate: u32) -> AudioClip {
    let bar = render_bar(pattern(style), bpm.max(1), sample_rate);
    let total = (duration_secs.max(0.0) * sample_rate as f64).round() as usize;
    if bar.is_empty() {
        return AudioClip::new(vec![0.0; total], sample_rate);
    }
    let samples: Vec<f32> = bar.iter().copied().cycle().take(total).collect();
    AudioClip::new(samples, sample_rate)
}

/// Length of one bar in seconds at `bpm` (4/4).
pub fn bar_secs(bpm: u32) -> f64 {
    4.0 * 60.0 / bpm.max(1) as f64
}

fn render_bar(pattern: &Pattern, bpm: u32, sample_rate: u32) -> Vec<f32> {
    let bar_len = (bar_secs(bpm) * sample_rate as f64).round() as usize;
    let step_len = bar_len / STEPS_PER_BAR;
    let mut bar = vec![0.0_f32; bar_len];
    let mut noise = NoiseSource::new(0x9e37_79b9);

    for (step, drums) in pattern.steps.iter().enumerate() {
        let offset = step * step_len;
        for drum in drums.iter() {
            let hit = render_drum(*drum, sample_rate, &mut noise);
            for (i, sample) in hit.iter().enumerate() {
                // Hits that run past the bar wrap into its start so loops are seamless.
                let idx = (offset + i) % bar_len.max(1);
                bar[idx] += sample;
            }
        }
    }

    for sample in &mut bar {
        *sample = sample.clamp(-1.0, 1.0);
    }
    bar
}

fn render_drum(drum: Drum, sample_rate: u32, noise: &mut NoiseSource) -> Vec<f32> {
    let sr = sample_rate as f32;
    let (length_secs, gain) = match drum {
        Drum::Kick => (0.35, 0.9),
        Drum::Snare => (0.2, 0.5),
        Drum::Clap => (0.15, 0.4),
        Drum::HiHat => (0.05, 0.2),
        Drum::OpenHat => (0.25, 0.18),
    };
    let len = (length_secs * sr) as usize;

    (0..len)
        .map(|i| {
            let t = i as f32 / sr;
            let env = (-t / (length_secs / 5.0)).exp();
            let body = match drum {
                Drum::Kick => {
                    // Pitch sweeps from 120 Hz down to 45 Hz.
                    let freq = 45.0 + 75.0 * (-t * 30.0).exp();
                    (2.0 * std::f32::consts::PI * freq * t).sin()
                }
                Drum::Snare => {
                    0.5 * (2.0 * std::f32::consts::PI * 190.0 * t).sin() + 0.5 * noise.next()
                }
                Drum::Clap | Drum::HiHat | Drum::OpenHat => noise.next(),
            };
            body * env * gain
        })
        .collect()
}

/// Deterministic xorshift noise so beats are reproducible.
struct NoiseSource {
    state: u32,
}

impl NoiseSource {
    fn new(seed: u32) -> Self {
        Self { state: seed.max(1) }
    }

    fn next(&mut self) -> f32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        (x as f32 / u32::MAX as f32) * 2.0 - 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beat_covers_requested_duration() {
        let beat = generate(BeatStyle::Trap, 140, 7.3, 24_000);
        assert_eq!(beat.samples.len(), (7.3_f64 * 24_000.0).round() as usize);
        assert!(beat.samples.iter().all(|s| (-1.0..=1.0).contains(s)));
    }

    #[test]
    fn test_beat_is_not_silent() {
        for style in BeatStyle::ALL {
            let beat = generate(style, style.default_bpm(), 4.0, 24_000);
            let peak = beat.samples.iter().fold(0.0_f32, |m, s| m.max(s.abs()));
            assert!(peak > 0.1, "{:?} peak {}", style, peak);
        }
    }

    #[test]
    fn test_bar_secs() {
        assert!((bar_secs(120) - 2.0).abs() < 1e-12);
    }
}
