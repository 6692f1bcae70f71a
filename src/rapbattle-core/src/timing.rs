//! Verse timing alignment against the final mixed track.
//!
//! Each verse gets a provisional duration proportional to its synthesized
//! clip, then all durations are stretched linearly so they sum to the mixed
//! track duration. The mix adds gaps between verses, so the stretch is what
//! keeps lines contiguous and ending exactly at the end of the track.

use serde::{Deserialize, Serialize};

use crate::error::AlignError;
use crate::participant::Speaker;

/// Tolerance used when checking contiguity and track coverage.
pub const TIMING_EPSILON: f64 = 1e-3;

/// Default minimum duration of any line, in seconds.
pub const DEFAULT_MIN_LINE_SECS: f64 = 0.5;

/// Lower bound applied to any requested floor, so no line collapses to zero.
pub const MIN_LINE_FLOOR_SECS: f64 = 0.01;

/// A time-bounded association of a verse's text to the final track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingLine {
    pub speaker: Speaker,
    pub text: String,
    pub start: f64,
    pub end: f64,
}

impl TimingLine {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Aligner input: one verse and the length of its synthesized clip.
#[derive(Debug, Clone, PartialEq)]
pub struct VerseDuration {
    pub speaker: Speaker,
    pub text: String,
    pub clip_secs: f64,
}

/// Produce contiguous timing lines covering `[0, track_secs]`.
///
/// Verses with a zero (or non-finite) clip duration receive the floor
/// `min_line_secs`; the remaining time is shared by the others in proportion
/// to their clip lengths. Lines that would fall under the floor are clamped to
/// it and the rest rescaled again. Any residue left by rounding goes to the
/// longest line. If the track is too short to give every line the floor, the
/// floor shrinks to an equal share of the track. A floor below
/// [`MIN_LINE_FLOOR_SECS`] is raised to it.
pub fn align(
    verses: &[VerseDuration],
    track_secs: f64,
    min_line_secs: f64,
) -> Result<Vec<TimingLine>, AlignError> {
    if verses.is_empty() {
        return Err(AlignError::NoVerses);
    }
    if !track_secs.is_finite() || track_secs <= 0.0 {
        return Err(AlignError::InvalidTrackDuration(track_secs));
    }

    let n = verses.len();
    let requested = if min_line_secs.is_finite() { min_line_secs } else { 0.0 };
    let floor = requested.max(MIN_LINE_FLOOR_SECS).min(track_secs / n as f64);

    let mut weights: Vec<f64> = verses
        .iter()
        .map(|v| if v.clip_secs.is_finite() && v.clip_secs > 0.0 { v.clip_secs } else { 0.0 })
        .collect();

    // Degenerate synthesis for every verse: split the track evenly.
    if weights.iter().all(|w| *w == 0.0) {
        weights.iter_mut().for_each(|w| *w = 1.0);
    }

    let durations = distribute(&weights, track_secs, floor);
    Ok(build_lines(verses, &durations, track_secs))
}

/// Share `total` across weights, never giving any entry less than `floor`.
fn distribute(weights: &[f64], total: f64, floor: f64) -> Vec<f64> {
    let n = weights.len();
    let mut fixed: Vec<Option<f64>> = weights
        .iter()
        .map(|w| if *w == 0.0 { Some(floor) } else { None })
        .collect();

    // Each pass fixes at least one more line or terminates.
    for _ in 0..=n {
        let fixed_total: f64 = fixed.iter().flatten().sum();
        let remaining = (total - fixed_total).max(0.0);
        let free_weight: f64 = weights
            .iter()
            .zip(&fixed)
            .filter(|(_, f)| f.is_none())
            .map(|(w, _)| *w)
            .sum();

        if free_weight <= 0.0 {
            break;
        }

        let scale = remaining / free_weight;
        let mut clamped_any = false;
        for (w, f) in weights.iter().zip(fixed.iter_mut()) {
            if f.is_none() && w * scale < floor {
                *f = Some(floor);
                clamped_any = true;
            }
        }

        if !clamped_any {
            return weights
                .iter()
                .zip(&fixed)
                .map(|(w, f)| f.unwrap_or(w * scale))
                .collect();
        }
    }

    let mut durations: Vec<f64> = fixed.into_iter().map(|f| f.unwrap_or(floor)).collect();
    let residual = total - durations.iter().sum::<f64>();
    if let Some(longest) = longest_index(&durations) {
        durations[longest] = (durations[longest] + residual).max(floor);
    }
    durations
}

/// Index of the longest entry; ties go to the later one (the finale).
fn longest_index(durations: &[f64]) -> Option<usize> {
    durations
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| a.total_cmp(b).then(ia.cmp(ib)))
        .map(|(i, _)| i)
}

fn build_lines(verses: &[VerseDuration], durations: &[f64], track_secs: f64) -> Vec<TimingLine> {
    let mut lines = Vec::with_capacity(verses.len());
    let mut cursor = 0.0;
    let last = verses.len() - 1;

    for (i, (verse, duration)) in verses.iter().zip(durations).enumerate() {
        let end = if i == last { track_secs } else { cursor + duration };
        lines.push(TimingLine {
            speaker: verse.speaker,
            text: verse.text.clone(),
            start: cursor,
            end,
        });
        cursor = end;
    }
    lines
}

/// One lyric line (a bar) placed inside its verse's interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarTiming {
    /// Index of the verse in the timing lines.
    pub verse: usize,
    pub speaker: Speaker,
    pub text: String,
    pub start: f64,
    pub end: f64,
}

/// Split every verse interval into bars, one per non-empty text line,
/// weighted by word count. Bars of a verse are contiguous and cover it
/// exactly. A verse without any text line yields one bar for the whole
/// interval.
pub fn split_bars(lines: &[TimingLine]) -> Vec<BarTiming> {
    let mut bars = Vec::new();
    for (verse, line) in lines.iter().enumerate() {
        let texts: Vec<&str> = line
            .text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        if texts.is_empty() {
            bars.push(BarTiming {
                verse,
                speaker: line.speaker,
                text: String::new(),
                start: line.start,
                end: line.end,
            });
            continue;
        }

        let words: Vec<f64> = texts
            .iter()
            .map(|t| t.split_whitespace().count().max(1) as f64)
            .collect();
        let total: f64 = words.iter().sum();
        let span = line.duration();
        let last = texts.len() - 1;

        let mut cursor = line.start;
        let mut seen = 0.0;
        for (i, (text, count)) in texts.iter().zip(&words).enumerate() {
            seen += count;
            let end = if i == last { line.end } else { line.start + span * seen / total };
            bars.push(BarTiming {
                verse,
                speaker: line.speaker,
                text: (*text).to_string(),
                start: cursor,
                end,
            });
            cursor = end;
        }
    }
    bars
}

/// Check sortedness, positive durations, contiguity and coverage.
pub fn validate_timing(lines: &[TimingLine], track_secs: f64) -> Result<(), AlignError> {
    let Some(last) = lines.last() else {
        return Err(AlignError::NoVerses);
    };
    if lines[0].start.abs() > TIMING_EPSILON {
        return Err(AlignError::Invariant(format!(
            "first line starts at {:.4}s",
            lines[0].start
        )));
    }
    for (i, line) in lines.iter().enumerate() {
        if line.start < 0.0 || line.end <= line.start {
            return Err(AlignError::Invariant(format!(
                "line {} has non-positive duration ({:.4}..{:.4})",
                i, line.start, line.end
            )));
        }
    }
    for (i, pair) in lines.windows(2).enumerate() {
        if (pair[0].end - pair[1].start).abs() > TIMING_EPSILON {
            return Err(AlignError::Invariant(format!(
                "gap between line {} and {}: {:.4} != {:.4}",
                i,
                i + 1,
                pair[0].end,
                pair[1].start
            )));
        }
    }
    if (last.end - track_secs).abs() > TIMING_EPSILON {
        return Err(AlignError::Invariant(format!(
            "last line ends at {:.4}s, track is {:.4}s",
            last.end, track_secs
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verses(durations: &[f64]) -> Vec<VerseDuration> {
        durations
            .iter()
            .enumerate()
            .map(|(i, d)| VerseDuration {
                speaker: if i % 2 == 0 { Speaker::A } else { Speaker::B },
                text: format!("verse {}", i + 1),
                clip_secs: *d,
            })
            .collect()
    }

    #[test]
    fn test_linear_stretch_preserves_proportions() {
        let lines = align(&verses(&[10.0, 20.0, 10.0]), 44.0, 0.5).unwrap();
        validate_timing(&lines, 44.0).unwrap();
        assert!((lines[0].duration() - 11.0).abs() < 1e-9);
        assert!((lines[1].duration() - 22.0).abs() < 1e-9);
        assert!((lines[2].duration() - 11.0).abs() < 1e-9);
        assert_eq!(lines[1].speaker, Speaker::B);
    }

    #[test]
    fn test_shrinking_track_also_stays_contiguous() {
        let lines = align(&verses(&[15.0, 15.0, 15.0, 15.0]), 58.2, 0.5).unwrap();
        validate_timing(&lines, 58.2).unwrap();
    }

    #[test]
    fn test_zero_duration_verse_gets_floor() {
        let lines = align(&verses(&[12.0, 0.0, 12.0, 16.0]), 40.0, 0.5).unwrap();
        validate_timing(&lines, 40.0).unwrap();
        assert!((lines[1].duration() - 0.5).abs() < 1e-9);
        // Remainder 39.5 stretched over 12:12:16
        assert!((lines[0].duration() - 39.5 * 12.0 / 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_all_zero_durations_split_evenly() {
        let lines = align(&verses(&[0.0, 0.0, 0.0, 0.0]), 20.0, 0.5).unwrap();
        validate_timing(&lines, 20.0).unwrap();
        for line in &lines {
            assert!((line.duration() - 5.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_tiny_verse_clamped_to_floor() {
        let lines = align(&verses(&[0.01, 30.0, 0.02, 30.0]), 30.0, 0.5).unwrap();
        validate_timing(&lines, 30.0).unwrap();
        assert!(lines.iter().all(|l| l.duration() >= 0.5 - 1e-9));
        assert!((lines[0].duration() - 0.5).abs() < 1e-9);
        assert!((lines[2].duration() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_track_shorter_than_floors() {
        let lines = align(&verses(&[3.0, 1.0, 0.0]), 0.9, 0.5).unwrap();
        validate_timing(&lines, 0.9).unwrap();
        assert!(lines.iter().all(|l| l.duration() >= 0.3 - 1e-9));
    }

    #[test]
    fn test_invariants_hold_across_distributions() {
        let distributions: [&[f64]; 6] = [
            &[1.0],
            &[0.0],
            &[5.0, 0.0],
            &[0.1, 0.1, 0.1, 90.0],
            &[7.3, 8.1, 6.9, 12.4, 9.9, 15.2],
            &[f64::NAN, 4.0, -2.0, 4.0],
        ];
        for durations in distributions {
            let sum: f64 = durations.iter().filter(|d| d.is_finite() && **d > 0.0).sum();
            for track in [sum * 0.9 + 1.0, sum + 3.5, 2.0] {
                let lines = align(&verses(durations), track, 0.5).unwrap();
                assert_eq!(lines.len(), durations.len());
                validate_timing(&lines, track)
                    .unwrap_or_else(|e| panic!("{:?} on {track}: {e}", durations));
            }
        }
    }

    #[test]
    fn test_rejects_empty_and_bad_track() {
        assert_eq!(align(&[], 10.0, 0.5), Err(AlignError::NoVerses));
        assert!(matches!(
            align(&verses(&[1.0]), 0.0, 0.5),
            Err(AlignError::InvalidTrackDuration(_))
        ));
    }

    #[test]
    fn test_zero_floor_still_gives_positive_durations() {
        let lines = align(&verses(&[5.0, 0.0, 5.0]), 10.5, 0.0).unwrap();
        validate_timing(&lines, 10.5).unwrap();
        assert!(lines.iter().all(|l| l.duration() >= MIN_LINE_FLOOR_SECS - 1e-9));

        let lines = align(&verses(&[0.0, 0.0]), 4.0, -1.0).unwrap();
        validate_timing(&lines, 4.0).unwrap();
    }

    #[test]
    fn test_bars_split_verse_by_word_count() {
        let lines = vec![
            TimingLine {
                speaker: Speaker::A,
                text: "one two three\n\nfour\n  ".into(),
                start: 0.0,
                end: 8.0,
            },
            TimingLine { speaker: Speaker::B, text: "".into(), start: 8.0, end: 10.0 },
        ];
        let bars = split_bars(&lines);
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].text, "one two three");
        assert!((bars[0].end - 6.0).abs() < 1e-9);
        assert_eq!(bars[1].text, "four");
        assert_eq!(bars[1].start, bars[0].end);
        assert_eq!(bars[1].end, 8.0);
        assert_eq!(bars[2].verse, 1);
        assert_eq!((bars[2].start, bars[2].end), (8.0, 10.0));
    }

    #[test]
    fn test_bars_stay_inside_aligned_verses() {
        let mut inputs = verses(&[7.0, 9.0, 0.0, 12.0]);
        inputs[0].text = "mic check\nthe crowd goes wild tonight\nyou already lost".into();
        inputs[3].text = "final bar".into();
        let lines = align(&inputs, 31.0, 0.5).unwrap();
        let bars = split_bars(&lines);

        for (i, line) in lines.iter().enumerate() {
            let own: Vec<&BarTiming> = bars.iter().filter(|b| b.verse == i).collect();
            assert!(!own.is_empty());
            assert_eq!(own[0].start, line.start);
            assert_eq!(own[own.len() - 1].end, line.end);
            for pair in own.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
            }
            assert!(own.iter().all(|b| b.end > b.start && b.speaker == line.speaker));
        }
        assert_eq!(bars.iter().filter(|b| b.verse == 0).count(), 3);
    }

    #[test]
    fn test_validate_detects_gap() {
        let lines = vec![
            TimingLine { speaker: Speaker::A, text: "a".into(), start: 0.0, end: 1.0 },
            TimingLine { speaker: Speaker::B, text: "b".into(), start: 1.1, end: 2.0 },
        ];
        assert!(validate_timing(&lines, 2.0).is_err());
    }
}
