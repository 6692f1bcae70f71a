//! Tempo detection and waveform envelope sampling.
//!
//! Both operate on finished tracks. The tempo reported to clients comes from
//! the final mix; any tempo supplied with a request is only a hint for the
//! lyric and beat stages.

use tracing::debug;

use crate::audio::AudioClip;

/// Onset analysis hop size in samples.
const HOP_SIZE: usize = 256;
const MIN_BPM: f64 = 60.0;
const MAX_BPM: f64 = 180.0;
/// Tempo prior centre; ties between tempo octaves resolve towards it.
const PRIOR_BPM: f64 = 120.0;
/// Width of the prior in octaves.
const PRIOR_OCTAVES: f64 = 1.0;
/// Peak amplitude below which a track is treated as silent.
const SILENCE_FLOOR: f32 = 1e-2;

/// Common hip-hop tempos used when generating a beat.
pub const COMMON_BPMS: [u32; 11] = [85, 90, 95, 100, 105, 110, 120, 130, 140, 145, 150];

/// Estimate the tempo of a track in beats per minute.
///
/// Returns `None` for silent or too-short input.
pub fn detect_tempo(clip: &AudioClip) -> Option<f32> {
    if clip.sample_rate == 0 {
        return None;
    }
    let onset = onset_envelope(&clip.samples);
    let hop_secs = HOP_SIZE as f64 / clip.sample_rate as f64;

    let min_lag = ((60.0 / MAX_BPM) / hop_secs).floor().max(1.0) as usize;
    let max_lag = ((60.0 / MIN_BPM) / hop_secs).ceil() as usize;
    if onset.len() < max_lag * 2 {
        return None;
    }

    let mean = onset.iter().sum::<f64>() / onset.len() as f64;
    let centered: Vec<f64> = onset.iter().map(|v| v - mean).collect();
    let energy: f64 = centered.iter().map(|v| v * v).sum();
    if energy <= f64::EPSILON {
        return None;
    }

    // Autocorrelation per lag, one extra on each side for interpolation.
    let lo = min_lag.saturating_sub(1).max(1);
    let hi = max_lag + 1;
    let acf: Vec<f64> = (lo..=hi).map(|lag| autocorrelation(&centered, lag)).collect();

    let mut best: Option<(usize, f64)> = None;
    for lag in min_lag..=max_lag {
        let value = acf[lag - lo];
        if value <= 0.0 {
            continue;
        }
        let bpm = 60.0 / (lag as f64 * hop_secs);
        let score = value * tempo_prior(bpm);
        if best.is_none_or(|(_, s)| score > s) {
            best = Some((lag, score));
        }
    }

    let (lag, _) = best?;
    let refined = refine_lag(&acf, lag - lo) + lo as f64;
    let bpm = 60.0 / (refined * hop_secs);
    debug!(bpm, lag, "detected tempo");
    Some(bpm as f32)
}

/// Snap a tempo to the closest common hip-hop tempo.
pub fn snap_bpm(bpm: f32) -> u32 {
    COMMON_BPMS
        .into_iter()
        .min_by(|a, b| {
            let da = (*a as f32 - bpm).abs();
            let db = (*b as f32 - bpm).abs();
            da.total_cmp(&db)
        })
        .unwrap_or(120)
}

/// Sample the amplitude envelope into exactly `resolution` buckets.
///
/// Each bucket is the mean absolute amplitude of an equal-width time window,
/// normalized by the loudest bucket. Near-silent input yields a near-zero
/// flat array.
pub fn sample_envelope(clip: &AudioClip, resolution: usize) -> Vec<f32> {
    let mut buckets = vec![0.0_f32; resolution];
    let len = clip.samples.len();
    if len == 0 || resolution == 0 {
        return buckets;
    }

    for (i, bucket) in buckets.iter_mut().enumerate() {
        let start = i * len / resolution;
        let end = ((i + 1) * len / resolution).max(start + 1).min(len);
        let window = &clip.samples[start.min(len - 1)..end];
        let sum: f32 = window.iter().map(|s| s.abs()).sum();
        *bucket = sum / window.len() as f32;
    }

    let peak = buckets.iter().copied().fold(0.0_f32, f32::max).max(SILENCE_FLOOR);
    for bucket in &mut buckets {
        *bucket = (*bucket / peak).clamp(0.0, 1.0);
    }
    buckets
}

/// Half-wave rectified energy flux per hop.
fn onset_envelope(samples: &[f32]) -> Vec<f64> {
    let frames: Vec<f64> = samples
        .chunks(HOP_SIZE)
        .map(|frame| frame.iter().map(|s| (*s as f64) * (*s as f64)).sum::<f64>() / frame.len() as f64)
        .collect();

    let mut onset = Vec::with_capacity(frames.len());
    let mut previous = 0.0;
    for energy in frames {
        let log_energy = (1.0 + 1000.0 * energy).ln();
        onset.push((log_energy - previous).max(0.0));
        previous = log_energy;
    }
    onset
}

fn autocorrelation(signal: &[f64], lag: usize) -> f64 {
    if lag >= signal.len() {
        return 0.0;
    }
    let n = signal.len() - lag;
    let sum: f64 = signal[..n].iter().zip(&signal[lag..]).map(|(a, b)| a * b).sum();
    sum / n as f64
}

fn tempo_prior(bpm: f64) -> f64 {
    let octaves = (bpm / PRIOR_BPM).log2();
    (-0.5 * (octaves / PRIOR_OCTAVES).powi(2)).exp()
}

/// Parabolic interpolation around a local maximum.
fn refine_lag(acf: &[f64], idx: usize) -> f64 {
    if idx == 0 || idx + 1 >= acf.len() {
        return idx as f64;
    }
    let (a, b, c) = (acf[idx - 1], acf[idx], acf[idx + 1]);
    let denom = a - 2.0 * b + c;
    if denom.abs() < f64::EPSILON {
        return idx as f64;
    }
    let offset = 0.5 * (a - c) / denom;
    idx as f64 + offset.clamp(-0.5, 0.5)
}
