//! Per-battle worker: binds a voice provider and runs the stage table.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::{debug, info};

use crate::analyzer;
use crate::audio::{AudioClip, PIPELINE_SAMPLE_RATE, artifact_url};
use crate::battle::{BattleId, BattleRequest, BattleStatus, Verse, VoiceClipRef};
use crate::beat;
use crate::error::{BattleError, StageFailure};
use crate::lyrics;
use crate::mixer::{self, MixSettings};
use crate::orchestrator::{BattleEntry, Inner};
use crate::participant::Speaker;
use crate::provider::{StyleHints, VoiceBinding, VoiceSample, select_voice_provider};
use crate::stage::{
    STAGE_TABLE, StageDescriptor, StageHandler, StageId, StageOutcome, StageResult, StageRunner,
    StageStatus,
};
use crate::timing::{self, VerseDuration};

/// Select a provider, then run every stage. Returns the battle outcome; the
/// caller publishes the terminal status.
pub(crate) async fn drive(inner: Arc<Inner>, entry: Arc<BattleEntry>) -> Result<(), BattleError> {
    let (battle_id, request) = entry.commit(|state| {
        state.status = BattleStatus::InProgress;
        state.message = "Selecting voice provider".to_string();
        (state.battle_id, state.request.clone())
    });

    let provider = tokio::select! {
        biased;
        _ = entry.cancel.cancelled() => return Err(BattleError::Cancelled),
        selected = select_voice_provider(&inner.providers.voices) => selected?,
    };
    info!(%battle_id, provider = provider.name(), "battle started");

    let binding = VoiceBinding::new(provider, inner.config.timeouts.voice_clone());
    let runner = StageRunner::new(&STAGE_TABLE, entry.cancel.clone())?;
    let worker = BattleWorker {
        inner,
        entry,
        battle_id,
        request,
        binding,
        samples: OnceLock::new(),
        verses: OnceLock::new(),
        clips: OnceLock::new(),
        beat: OnceLock::new(),
        mixed: OnceLock::new(),
    };

    runner.run(&worker).await.map(|_| ())
}

/// Run CPU-bound audio work or file writes off the async workers.
async fn blocking<T, F>(work: F) -> Result<T, StageFailure>
where
    F: FnOnce() -> Result<T, StageFailure> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StageFailure::Invalid(format!("audio task failed: {}", e)))?
}

/// Each artifact is produced by exactly one stage and read by later ones,
/// so stages of one wave share the worker through `&self`.
struct BattleWorker {
    inner: Arc<Inner>,
    entry: Arc<BattleEntry>,
    battle_id: BattleId,
    request: BattleRequest,
    binding: VoiceBinding,
    samples: OnceLock<HashMap<Speaker, VoiceSample>>,
    verses: OnceLock<Vec<Verse>>,
    clips: OnceLock<Arc<Vec<AudioClip>>>,
    beat: OnceLock<Arc<AudioClip>>,
    mixed: OnceLock<Arc<AudioClip>>,
}

fn missing(what: &str) -> StageFailure {
    StageFailure::Invalid(format!("{} is not available", what))
}

fn produce<T>(cell: &OnceLock<T>, value: T, what: &str) -> Result<(), StageFailure> {
    cell.set(value)
        .map_err(|_| StageFailure::Invalid(format!("{} was already produced", what)))
}

impl BattleWorker {
    /// Tempo the performance targets before the final mix is analyzed.
    fn target_bpm(&self) -> u32 {
        self.request
            .bpm_hint
            .unwrap_or_else(|| self.request.beat_style.default_bpm())
    }

    fn sample(&self, speaker: Speaker) -> Option<&VoiceSample> {
        self.samples.get().and_then(|samples| samples.get(&speaker))
    }

    fn verses(&self) -> Result<&[Verse], StageFailure> {
        match self.verses.get() {
            Some(verses) if !verses.is_empty() => Ok(verses),
            _ => Err(missing("lyrics")),
        }
    }

    fn clips(&self) -> Result<Arc<Vec<AudioClip>>, StageFailure> {
        self.clips.get().cloned().ok_or_else(|| missing("voice clips"))
    }

    async fn normalize(&self) -> Result<StageOutcome, StageFailure> {
        let dir = self.inner.store.battle_dir(&self.battle_id);
        tokio::fs::create_dir_all(&dir).await?;

        if self.request.all_lyrics_provided() {
            let verses = lyrics::write_verses(
                None,
                &self.request,
                &self.inner.config.prompts,
                self.inner.config.timeouts.text(),
            )
            .await?;
            let published = verses.clone();
            produce(&self.verses, verses, "lyrics")?;
            self.entry.commit(|state| state.artifacts.verses = published);
        }

        Ok(StageOutcome::completed(format!(
            "{} vs {}, {} verse(s) each",
            self.request.fighter_a.name,
            self.request.fighter_b.name,
            self.request.effective_verse_count()
        )))
    }

    async fn prepare_voices(&self) -> Result<StageOutcome, StageFailure> {
        let mut samples = HashMap::new();
        for speaker in Speaker::BOTH {
            let participant = self.request.participant(speaker);
            if let Some(path) = &participant.voice_sample {
                let sample = VoiceSample::load(path, &participant.name).await?;
                samples.insert(speaker, sample);
            }
        }
        produce(&self.samples, samples, "voice samples")?;

        let handles = try_join_all(Speaker::BOTH.into_iter().map(|speaker| {
            self.binding
                .voice(speaker, self.request.participant(speaker), self.sample(speaker))
        }))
        .await?;

        let cloned = handles.iter().filter(|h| h.cloned).count();
        Ok(StageOutcome::completed(format!(
            "Voices ready on {} ({} cloned)",
            self.binding.provider_name(),
            cloned
        )))
    }

    async fn write_lyrics(&self) -> Result<StageOutcome, StageFailure> {
        let verses = lyrics::write_verses(
            self.inner.providers.text.as_deref(),
            &self.request,
            &self.inner.config.prompts,
            self.inner.config.timeouts.text(),
        )
        .await?;

        let published = verses.clone();
        let count = verses.len();
        produce(&self.verses, verses, "lyrics")?;
        self.entry.commit(|state| state.artifacts.verses = published);
        Ok(StageOutcome::completed(format!("Wrote {} verses", count)))
    }

    async fn synthesize(&self) -> Result<StageOutcome, StageFailure> {
        let verses = self.verses()?;
        let total = verses.len();
        let finished = AtomicUsize::new(0);
        let timeout = self.inner.config.timeouts.voice();
        let bpm = self.target_bpm();

        let jobs = verses.iter().map(|verse| {
            let finished = &finished;
            async move {
                let participant = self.request.participant(verse.speaker);
                let voice = self
                    .binding
                    .voice(verse.speaker, participant, self.sample(verse.speaker))
                    .await?;
                let hints = StyleHints {
                    style: participant.style,
                    beat_style: self.request.beat_style,
                    bpm: Some(bpm),
                    finale: verse.finale,
                };
                let clip = self
                    .binding
                    .synthesize(&verse.text, &voice, &hints, timeout)
                    .await?
                    .resample(PIPELINE_SAMPLE_RATE);

                let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                self.entry.report(
                    StageId::Synthesis,
                    done as f32 / total as f32,
                    format!("Synthesized verse {} of {}", done, total),
                );
                Ok::<_, StageFailure>(clip)
            }
        });
        let clips = Arc::new(try_join_all(jobs).await?);

        let inner = Arc::clone(&self.inner);
        let battle_id = self.battle_id;
        let owned = verses.to_vec();
        let saved = Arc::clone(&clips);
        let refs = blocking(move || {
            owned
                .iter()
                .zip(saved.iter())
                .map(|(verse, clip)| {
                    let file_name = format!("verse_{:02}_{}.wav", verse.sequence, verse.speaker);
                    let path = inner.store.save_clip(&battle_id, &file_name, clip)?;
                    Ok(VoiceClipRef {
                        sequence: verse.sequence,
                        speaker: verse.speaker,
                        path,
                        duration_secs: clip.duration_secs(),
                    })
                })
                .collect::<Result<Vec<_>, StageFailure>>()
        })
        .await?;

        produce(&self.clips, clips, "voice clips")?;
        self.entry.commit(|state| state.artifacts.voice_clips = refs);
        Ok(StageOutcome::completed(format!(
            "Synthesized {} verses with {}",
            total,
            self.binding.provider_name()
        )))
    }

    async fn make_beat(&self) -> Result<StageOutcome, StageFailure> {
        let clips = self.clips()?;
        let gap = self.inner.config.pipeline.verse_gap_secs;
        let style = self.request.beat_style;
        let hint = self.request.bpm_hint;
        let inner = Arc::clone(&self.inner);
        let battle_id = self.battle_id;

        let (beat, bpm, source, reference) = blocking(move || {
            let vocals = AudioClip::concat(&clips, gap, PIPELINE_SAMPLE_RATE);
            let (bpm, source) = match hint {
                Some(hint) => (hint, "requested"),
                None => match analyzer::detect_tempo(&vocals) {
                    Some(detected) => (analyzer::snap_bpm(detected), "detected"),
                    None => (style.default_bpm(), "default"),
                },
            };
            let beat = beat::generate(style, bpm, vocals.duration_secs(), PIPELINE_SAMPLE_RATE);
            let reference = inner.store.save_clip(&battle_id, "beat.wav", &beat)?;
            Ok((beat, bpm, source, reference))
        })
        .await?;
        debug!(battle_id = %self.battle_id, bpm, source, "beat tempo chosen");

        produce(&self.beat, Arc::new(beat), "beat")?;
        let published = reference.clone();
        self.entry.commit(|state| {
            state.artifacts.beat = Some(published);
            state.artifacts.beat_bpm = Some(bpm);
        });
        Ok(StageOutcome::with_artifact(
            format!("{} beat at {} BPM ({})", style.display_name(), bpm, source),
            reference,
        ))
    }

    async fn mix(&self) -> Result<StageOutcome, StageFailure> {
        let beat = self.beat.get().cloned().ok_or_else(|| missing("beat"))?;
        let clips = self.clips()?;
        let pipeline = &self.inner.config.pipeline;
        let settings = MixSettings {
            verse_gap_secs: pipeline.verse_gap_secs,
            beat_gain_db: pipeline.beat_gain_db,
        };
        let file_name = format!("battle_{}.wav", self.battle_id.short());
        let inner = Arc::clone(&self.inner);
        let battle_id = self.battle_id;

        let (mixed, reference) = blocking(move || {
            let mixed = mixer::mix(&clips, &beat, &settings)?;
            let reference = inner.store.save_clip(&battle_id, &file_name, &mixed)?;
            Ok((mixed, reference))
        })
        .await?;
        let duration = mixed.duration_secs();
        produce(&self.mixed, Arc::new(mixed), "mixed track")?;

        let published = reference.clone();
        self.entry.commit(|state| {
            state.artifacts.mixed_audio = Some(published);
            state.artifacts.mixed_duration_secs = Some(duration);
        });
        Ok(StageOutcome::with_artifact(
            format!("Mixed {:.1}s track", duration),
            reference,
        ))
    }

    async fn align(&self) -> Result<StageOutcome, StageFailure> {
        let mixed = self.mixed.get().cloned().ok_or_else(|| missing("mixed track"))?;
        let clips = self.clips()?;
        let pipeline = &self.inner.config.pipeline;
        let track_secs = mixed.duration_secs();

        let inputs: Vec<VerseDuration> = self
            .verses()?
            .iter()
            .zip(clips.iter())
            .map(|(verse, clip)| VerseDuration {
                speaker: verse.speaker,
                text: verse.text.clone(),
                clip_secs: clip.duration_secs(),
            })
            .collect();

        let lines = timing::align(&inputs, track_secs, pipeline.min_line_secs)?;
        timing::validate_timing(&lines, track_secs)?;
        let bars = timing::split_bars(&lines);

        let resolution = pipeline.waveform_resolution;
        let (waveform, detected) = blocking(move || {
            Ok((
                analyzer::sample_envelope(&mixed, resolution),
                analyzer::detect_tempo(&mixed),
            ))
        })
        .await?;

        let message = match detected {
            Some(bpm) => format!("Aligned {} lines, detected {:.1} BPM", lines.len(), bpm),
            None => format!("Aligned {} lines, tempo not detected", lines.len()),
        };
        self.entry.commit(|state| {
            state.artifacts.timing = lines;
            state.artifacts.bars = bars;
            state.artifacts.waveform = waveform;
            state.artifacts.detected_bpm = detected;
        });
        Ok(StageOutcome::completed(message))
    }

    async fn render_video(&self) -> Result<StageOutcome, StageFailure> {
        let lipsync = self
            .inner
            .providers
            .lipsync
            .clone()
            .ok_or_else(|| missing("lip-sync provider"))?;
        let base = self
            .inner
            .config
            .video
            .public_base_url
            .as_deref()
            .ok_or_else(|| missing("video.public_base_url"))?
            .trim_end_matches('/')
            .to_string();

        let faces: Vec<(Speaker, String)> = Speaker::BOTH
            .into_iter()
            .filter_map(|speaker| {
                let face = self.request.participant(speaker).face_reference.as_deref()?;
                Some((speaker, public_url(&base, face)))
            })
            .collect();

        let verses = self.verses()?.to_vec();
        let clips = self.clips()?;
        let gap = self.inner.config.pipeline.verse_gap_secs;
        let inner = Arc::clone(&self.inner);
        let battle_id = self.battle_id;
        let jobs = blocking(move || {
            faces
                .into_iter()
                .map(|(speaker, face)| {
                    let track = solo_track(&verses, &clips, speaker, gap);
                    let file_name = format!("vocals_{}.wav", speaker);
                    let reference = inner.store.save_clip(&battle_id, &file_name, &track)?;
                    Ok((speaker, face, public_url(&base, &reference)))
                })
                .collect::<Result<Vec<_>, StageFailure>>()
        })
        .await?;

        let timeout = self.inner.config.timeouts.video();
        let lipsync = &lipsync;
        let rendered = try_join_all(jobs.into_iter().map(|(speaker, face, audio_url)| async move {
            let video = tokio::time::timeout(timeout, lipsync.lipsync(&face, &audio_url))
                .await
                .map_err(|_| StageFailure::Timeout {
                    operation: "lip-sync rendering",
                    after: timeout,
                })?
                .map_err(StageFailure::from)?;
            Ok::<_, StageFailure>((speaker, video))
        }))
        .await?;

        let talking_heads: BTreeMap<Speaker, String> = rendered.into_iter().collect();
        let count = talking_heads.len();
        self.entry.commit(|state| state.artifacts.talking_heads = talking_heads);
        Ok(StageOutcome::completed(format!("Rendered {} talking head(s)", count)))
    }
}

/// Absolute URL of a face or audio reference. Stored artifacts are served
/// under `/outputs/`; anything with a scheme is passed through.
fn public_url(base: &str, reference: &str) -> String {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        reference.to_string()
    } else {
        format!("{}{}", base, artifact_url(reference))
    }
}

/// Vocals of one speaker on the full track timeline, silent elsewhere.
fn solo_track(verses: &[Verse], clips: &[AudioClip], speaker: Speaker, gap_secs: f64) -> AudioClip {
    let clips: Vec<AudioClip> = verses
        .iter()
        .zip(clips)
        .map(|(verse, clip)| {
            if verse.speaker == speaker {
                clip.clone()
            } else {
                AudioClip::new(vec![0.0; clip.samples.len()], clip.sample_rate)
            }
        })
        .collect();
    AudioClip::concat(&clips, gap_secs, PIPELINE_SAMPLE_RATE)
}

#[async_trait]
impl StageHandler for BattleWorker {
    fn skip_reason(&self, stage: StageId) -> Option<String> {
        match stage {
            StageId::Lyrics if self.request.all_lyrics_provided() => {
                Some("Using provided lyrics".to_string())
            }
            StageId::Video => self.video_skip_reason(),
            _ => None,
        }
    }

    async fn run_stage(&self, stage: StageId) -> Result<StageOutcome, StageFailure> {
        match stage {
            StageId::Normalize => self.normalize().await,
            StageId::VoicePrep => self.prepare_voices().await,
            StageId::Lyrics => self.write_lyrics().await,
            StageId::Synthesis => self.synthesize().await,
            StageId::Beat => self.make_beat().await,
            StageId::Mix => self.mix().await,
            StageId::Align => self.align().await,
            StageId::Video => self.render_video().await,
        }
    }

    fn record(&self, descriptor: &StageDescriptor, result: &StageResult) {
        let result = result.clone();
        self.entry.commit(|state| {
            state.stage = Some(descriptor.id);
            state.message = result.message.clone();
            let progress = match result.status {
                StageStatus::Pending | StageStatus::Running => descriptor.progress_start,
                StageStatus::Cancelled | StageStatus::Failed => state.progress,
                StageStatus::Succeeded | StageStatus::Skipped => descriptor.progress_end,
            };
            state.progress = state.progress.max(progress);
            match state.stages.iter_mut().find(|r| r.stage == result.stage) {
                Some(existing) => *existing = result,
                None => state.stages.push(result),
            }
        });
    }
}

impl BattleWorker {
    fn video_skip_reason(&self) -> Option<String> {
        let reason = if self.request.audio_only {
            "Audio-only battle"
        } else if self.request.test_mode {
            "Test mode skips video"
        } else if !self
            .inner
            .providers
            .lipsync
            .as_ref()
            .is_some_and(|p| p.is_available())
        {
            "No lip-sync provider available"
        } else if self.inner.config.video.public_base_url.is_none() {
            "video.public_base_url is not set"
        } else if Speaker::BOTH
            .iter()
            .all(|s| self.request.participant(*s).face_reference.is_none())
        {
            "No face references supplied"
        } else {
            return None;
        };
        Some(reason.to_string())
    }
}
