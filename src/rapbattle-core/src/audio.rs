//! Mono PCM clips, WAV I/O and artifact storage.

use std::io::Cursor;
use std::path::{Component, Path, PathBuf};

use uuid::Uuid;

use crate::battle::BattleId;
use crate::error::AudioError;

/// Sample rate every clip is converted to before mixing.
pub const PIPELINE_SAMPLE_RATE: u32 = 24_000;

/// A mono clip of f32 samples in [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioClip {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn silence(seconds: f64, sample_rate: u32) -> Self {
        let len = (seconds.max(0.0) * sample_rate as f64).round() as usize;
        Self::new(vec![0.0; len], sample_rate)
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Convert to another sample rate using linear interpolation.
    pub fn resample(self, target_rate: u32) -> AudioClip {
        if self.sample_rate == target_rate || self.samples.is_empty() || self.sample_rate == 0 {
            return AudioClip::new(self.samples, target_rate);
        }

        let ratio = self.sample_rate as f64 / target_rate as f64;
        let new_len = (self.samples.len() as f64 / ratio) as usize;
        let mut result = Vec::with_capacity(new_len);

        for i in 0..new_len {
            let src_pos = i as f64 * ratio;
            let src_idx = src_pos as usize;
            let frac = (src_pos - src_idx as f64) as f32;

            if src_idx + 1 < self.samples.len() {
                result.push(self.samples[src_idx] * (1.0 - frac) + self.samples[src_idx + 1] * frac);
            } else if src_idx < self.samples.len() {
                result.push(self.samples[src_idx]);
            }
        }

        AudioClip::new(result, target_rate)
    }

    /// Join clips in order with a silence gap between them.
    /// All clips must share `sample_rate`.
    pub fn concat(clips: &[AudioClip], gap_secs: f64, sample_rate: u32) -> AudioClip {
        let gap_samples = (gap_secs.max(0.0) * sample_rate as f64).round() as usize;
        let total: usize = clips.iter().map(|c| c.samples.len()).sum::<usize>()
            + gap_samples * clips.len().saturating_sub(1);

        let mut combined = Vec::with_capacity(total);
        for (i, clip) in clips.iter().enumerate() {
            if i > 0 {
                combined.extend(std::iter::repeat_n(0.0, gap_samples));
            }
            combined.extend_from_slice(&clip.samples);
        }

        AudioClip::new(combined, sample_rate)
    }

    /// Decode little-endian signed 16-bit mono PCM.
    pub fn from_pcm16le(bytes: &[u8], sample_rate: u32) -> AudioClip {
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / i16::MAX as f32)
            .collect();
        AudioClip::new(samples, sample_rate)
    }

    /// Decode a WAV file held in memory, downmixing to mono.
    pub fn from_wav_bytes(bytes: &[u8]) -> Result<AudioClip, AudioError> {
        let reader = hound::WavReader::new(Cursor::new(bytes))?;
        decode_wav(reader)
    }

    pub fn write_wav(&self, path: &Path) -> Result<(), AudioError> {
        std::fs::write(path, self.to_wav_bytes()?)?;
        Ok(())
    }

    /// Encode as an in-memory 16-bit WAV.
    pub fn to_wav_bytes(&self) -> Result<Vec<u8>, AudioError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
            for &sample in &self.samples {
                writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
            }
            writer.finalize()?;
        }
        Ok(cursor.into_inner())
    }
}

fn decode_wav<R: std::io::Read>(reader: hound::WavReader<R>) -> Result<AudioClip, AudioError> {
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    let samples = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    Ok(AudioClip::new(samples, spec.sample_rate))
}

/// Route prefix under which artifact references are served.
pub const OUTPUTS_ROUTE: &str = "/outputs";

/// URL path of an artifact reference.
pub fn artifact_url(reference: &str) -> String {
    format!("{}/{}", OUTPUTS_ROUTE, reference.trim_start_matches('/'))
}

/// Directory under the store root that holds user uploads.
pub const UPLOADS_DIR: &str = "uploads";

/// Kind of user-supplied file the store accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Voice,
    Image,
}

impl UploadKind {
    pub fn dir(&self) -> &'static str {
        match self {
            UploadKind::Voice => "voice",
            UploadKind::Image => "image",
        }
    }

    fn extensions(&self) -> &'static [&'static str] {
        match self {
            UploadKind::Voice => &["wav", "mp3", "m4a", "ogg", "flac", "webm"],
            UploadKind::Image => &["png", "jpg", "jpeg", "webp"],
        }
    }
}

/// Writes battle artifacts under `<root>/<battle_id>/`.
///
/// References handed out are relative to `root` and are served by the HTTP
/// layer under `/outputs/`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn battle_dir(&self, battle_id: &BattleId) -> PathBuf {
        self.root.join(battle_id.to_string())
    }

    /// Write a clip as WAV and return its reference.
    pub fn save_clip(
        &self,
        battle_id: &BattleId,
        file_name: &str,
        clip: &AudioClip,
    ) -> Result<String, AudioError> {
        let dir = self.battle_dir(battle_id);
        std::fs::create_dir_all(&dir)?;
        clip.write_wav(&dir.join(file_name))?;
        Ok(format!("{}/{}", battle_id, file_name))
    }

    /// Absolute path of an artifact reference.
    pub fn resolve(&self, reference: &str) -> PathBuf {
        self.root.join(reference)
    }

    /// Store an uploaded file under `uploads/<kind>/` with a fresh name and
    /// return its reference. WAV voice samples must decode to audio.
    pub fn save_upload(
        &self,
        kind: UploadKind,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<String, AudioError> {
        let extension = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .filter(|e| kind.extensions().contains(&e.as_str()))
            .ok_or_else(|| {
                AudioError::Unsupported(format!("{} upload '{}'", kind.dir(), file_name))
            })?;
        if bytes.is_empty() {
            return Err(AudioError::Empty(file_name.to_string()));
        }
        if kind == UploadKind::Voice && extension == "wav" {
            let clip = AudioClip::from_wav_bytes(bytes)?;
            if clip.is_empty() {
                return Err(AudioError::Empty(file_name.to_string()));
            }
        }

        let dir = self.root.join(UPLOADS_DIR).join(kind.dir());
        std::fs::create_dir_all(&dir)?;
        let stored = format!("{}.{}", Uuid::new_v4().simple(), extension);
        std::fs::write(dir.join(&stored), bytes)?;
        Ok(format!("{}/{}/{}", UPLOADS_DIR, kind.dir(), stored))
    }

    /// Path of a stored upload of `kind`, or `None` when `reference` points
    /// anywhere else.
    pub fn resolve_upload(&self, kind: UploadKind, reference: &Path) -> Option<PathBuf> {
        if reference
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return None;
        }
        let uploads = self.root.join(UPLOADS_DIR).join(kind.dir());
        let candidate = if reference.is_absolute() {
            reference.to_path_buf()
        } else {
            self.root.join(reference)
        };
        (candidate.starts_with(&uploads) && candidate.is_file()).then_some(candidate)
    }

    /// Delete all artifacts of a battle.
    pub fn remove_battle(&self, battle_id: &BattleId) -> Result<(), AudioError> {
        let dir = self.battle_dir(battle_id);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_inserts_gaps() {
        let seg1 = AudioClip::new(vec![1.0, 1.0], 10);
        let seg2 = AudioClip::new(vec![2.0, 2.0], 10);
        let combined = AudioClip::concat(&[seg1, seg2], 0.1, 10); // 1 sample gap at 10Hz

        assert_eq!(combined.samples.len(), 5);
        assert_eq!(combined.samples[2], 0.0);
    }

    #[test]
    fn test_resample_halves_length() {
        let clip = AudioClip::new(vec![0.5; 4800], 48_000);
        let resampled = clip.resample(24_000);
        assert_eq!(resampled.sample_rate, 24_000);
        assert_eq!(resampled.samples.len(), 2400);
        assert!((resampled.duration_secs() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_pcm16_decode() {
        let bytes = [0x00, 0x00, 0xff, 0x7f, 0x01, 0x80];
        let clip = AudioClip::from_pcm16le(&bytes, 24_000);
        assert_eq!(clip.samples.len(), 3);
        assert_eq!(clip.samples[0], 0.0);
        assert!((clip.samples[1] - 1.0).abs() < 1e-6);
        assert!((clip.samples[2] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_wav_bytes_round_trip_keeps_duration() {
        let clip = AudioClip::new((0..2400).map(|i| (i as f32 * 0.01).sin() * 0.5).collect(), 24_000);
        let bytes = clip.to_wav_bytes().unwrap();
        let decoded = AudioClip::from_wav_bytes(&bytes).unwrap();
        assert_eq!(decoded.sample_rate, 24_000);
        assert_eq!(decoded.samples.len(), clip.samples.len());
    }

    #[test]
    fn test_artifact_store_writes_under_battle_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let id = BattleId::new();
        let reference = store
            .save_clip(&id, "mix.wav", &AudioClip::silence(0.1, 24_000))
            .unwrap();
        assert_eq!(reference, format!("{}/mix.wav", id));
        assert_eq!(artifact_url(&reference), format!("/outputs/{}/mix.wav", id));
        assert!(store.resolve(&reference).exists());
        store.remove_battle(&id).unwrap();
        assert!(!store.battle_dir(&id).exists());
    }

    #[test]
    fn test_voice_upload_is_stored_and_resolvable() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let wav = AudioClip::new(vec![0.25; 2400], 24_000).to_wav_bytes().unwrap();

        let reference = store.save_upload(UploadKind::Voice, "Nova Take.WAV", &wav).unwrap();
        assert!(reference.starts_with("uploads/voice/"));
        assert!(reference.ends_with(".wav"));

        let path = store.resolve_upload(UploadKind::Voice, Path::new(&reference)).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), wav);
        assert_eq!(store.resolve_upload(UploadKind::Voice, &path), Some(path.clone()));
        assert!(store.resolve_upload(UploadKind::Image, Path::new(&reference)).is_none());
    }

    #[test]
    fn test_upload_rejects_bad_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        assert!(matches!(
            store.save_upload(UploadKind::Image, "face.exe", b"MZ"),
            Err(AudioError::Unsupported(_))
        ));
        assert!(matches!(
            store.save_upload(UploadKind::Voice, "empty.mp3", b""),
            Err(AudioError::Empty(_))
        ));
        assert!(store.save_upload(UploadKind::Voice, "noise.wav", b"not a wav").is_err());
    }

    #[test]
    fn test_paths_outside_uploads_do_not_resolve() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let secret = dir.path().join("secret.wav");
        std::fs::write(&secret, b"x").unwrap();

        assert!(store.resolve_upload(UploadKind::Voice, &secret).is_none());
        assert!(store.resolve_upload(UploadKind::Voice, Path::new("/etc/passwd")).is_none());
        assert!(store
            .resolve_upload(UploadKind::Voice, Path::new("uploads/voice/../../secret.wav"))
            .is_none());
        assert!(store
            .resolve_upload(UploadKind::Voice, Path::new("uploads/voice/missing.wav"))
            .is_none());
    }
}
