//! End-to-end battle runs against in-process providers.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rapbattle_core::lyrics::VersePrompt;
use rapbattle_core::timing::validate_timing;
use rapbattle_core::{
    AudioClip, BattleError, BattleId, BattleOrchestrator, BattleRequest, BattleState, BattleStatus,
    BeatStyle, Config, DeliveryStyle, ErrorKind, LipSyncProvider, ParticipantInput, ProgressUpdate,
    ProviderError, ProviderSet, ProviderTier, Speaker, StageId, StageStatus, StyleHints,
    TextGenerator, VoiceHandle, VoiceProvider, VoiceSample, default_config,
};
use tempfile::TempDir;

struct MockVoice {
    name: &'static str,
    tier: ProviderTier,
    available: bool,
    sample_rate: u32,
    delay: Duration,
    failing: bool,
    availability_checks: AtomicUsize,
    clones: AtomicUsize,
    syntheses: AtomicUsize,
}

impl MockVoice {
    fn new(name: &'static str, tier: ProviderTier, available: bool) -> Self {
        Self {
            name,
            tier,
            available,
            sample_rate: 24_000,
            delay: Duration::ZERO,
            failing: false,
            availability_checks: AtomicUsize::new(0),
            clones: AtomicUsize::new(0),
            syntheses: AtomicUsize::new(0),
        }
    }

    fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn failing(mut self) -> Self {
        self.failing = true;
        self
    }
}

#[async_trait]
impl VoiceProvider for MockVoice {
    fn name(&self) -> &str {
        self.name
    }

    fn tier(&self) -> ProviderTier {
        self.tier
    }

    async fn is_available(&self) -> bool {
        self.availability_checks.fetch_add(1, Ordering::SeqCst);
        self.available
    }

    async fn clone_voice(
        &self,
        speaker: Speaker,
        _sample: &VoiceSample,
    ) -> Result<VoiceHandle, ProviderError> {
        self.clones.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(VoiceHandle {
            provider: self.name.to_string(),
            voice_id: format!("clone-{}", speaker),
            cloned: true,
        })
    }

    fn preset_voice(&self, style: DeliveryStyle) -> VoiceHandle {
        VoiceHandle::preset(self.name, style.key())
    }

    async fn synthesize(
        &self,
        text: &str,
        _voice: &VoiceHandle,
        _hints: &StyleHints,
    ) -> Result<AudioClip, ProviderError> {
        self.syntheses.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing {
            return Err(ProviderError::synthesis(self.name, "voice engine crashed"));
        }
        let secs = 0.5 + text.lines().count() as f64 * 0.25;
        Ok(tone(secs, self.sample_rate))
    }
}

struct MockLyricist {
    calls: AtomicUsize,
}

#[async_trait]
impl TextGenerator for MockLyricist {
    fn name(&self) -> &str {
        "mock-text"
    }

    async fn generate(&self, prompt: &VersePrompt) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!(
            "[Verse {}]\nbar one for verse {}\n**bar two** hits hard",
            prompt.sequence, prompt.sequence
        ))
    }
}

struct MockLipSync {
    audio_urls: Mutex<Vec<String>>,
}

#[async_trait]
impl LipSyncProvider for MockLipSync {
    fn name(&self) -> &str {
        "mock-lipsync"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn lipsync(&self, face_url: &str, audio_url: &str) -> Result<String, ProviderError> {
        self.audio_urls
            .lock()
            .unwrap()
            .push(audio_url.to_string());
        Ok(format!("{}.mp4", face_url))
    }
}

fn tone(secs: f64, sample_rate: u32) -> AudioClip {
    let len = (secs * sample_rate as f64) as usize;
    let samples = (0..len)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            0.4 * (2.0 * std::f32::consts::PI * 220.0 * t).sin()
        })
        .collect();
    AudioClip::new(samples, sample_rate)
}

fn test_config(dir: &Path) -> Config {
    let mut config = default_config();
    config.pipeline.output_dir = dir.to_path_buf();
    config
}

fn request() -> BattleRequest {
    BattleRequest::new(
        ParticipantInput::new("Nova", DeliveryStyle::Grime),
        ParticipantInput::new("Orbit", DeliveryStyle::WestCoast),
        "robots taking over the studio",
        BeatStyle::BoomBap,
    )
}

fn lyricist() -> Arc<MockLyricist> {
    Arc::new(MockLyricist {
        calls: AtomicUsize::new(0),
    })
}

async fn wait_for_terminal(orchestrator: &BattleOrchestrator, battle_id: &BattleId) -> ProgressUpdate {
    let mut subscription = orchestrator.subscribe(battle_id).unwrap();
    tokio::time::timeout(Duration::from_secs(60), async move {
        let mut last = None;
        while let Some(update) = subscription.next().await {
            last = Some(update);
        }
        last.unwrap()
    })
    .await
    .expect("battle did not finish in time")
}

fn stage_status(state: &BattleState, stage: StageId) -> Option<StageStatus> {
    state.stage_result(stage).map(|r| r.status)
}

#[tokio::test]
async fn test_happy_path_produces_aligned_track() {
    let dir = TempDir::new().unwrap();
    let voice = Arc::new(MockVoice::new("primary", ProviderTier::Primary, true).with_sample_rate(16_000));
    let text = lyricist();
    let providers = ProviderSet::new(vec![voice.clone()]).with_text(text.clone());
    let orchestrator = BattleOrchestrator::new(test_config(dir.path()), providers);

    let battle_id = orchestrator.submit(request()).unwrap();
    let terminal = wait_for_terminal(&orchestrator, &battle_id).await;
    assert_eq!(terminal.status, BattleStatus::Complete);
    assert_eq!(terminal.progress, 100.0);

    let state = orchestrator.get_state(&battle_id).unwrap();
    assert_eq!(text.calls.load(Ordering::SeqCst), 4);
    assert_eq!(voice.syntheses.load(Ordering::SeqCst), 4);
    assert_eq!(state.artifacts.verses.len(), 4);
    assert!(state.artifacts.verses.iter().all(|v| !v.text.contains("Verse") && !v.text.contains('*')));

    for stage in [
        StageId::Normalize,
        StageId::VoicePrep,
        StageId::Lyrics,
        StageId::Synthesis,
        StageId::Beat,
        StageId::Mix,
        StageId::Align,
    ] {
        assert_eq!(stage_status(&state, stage), Some(StageStatus::Succeeded), "{}", stage);
    }
    assert_eq!(stage_status(&state, StageId::Video), Some(StageStatus::Skipped));

    let mixed = state.artifacts.mixed_audio.clone().unwrap();
    let track_secs = state.artifacts.mixed_duration_secs.unwrap();
    assert!(orchestrator.store().resolve(&mixed).exists());
    assert_eq!(state.artifacts.voice_clips.len(), 4);
    assert_eq!(state.artifacts.waveform.len(), 200);
    assert!(validate_timing(&state.artifacts.timing, track_secs).is_ok());
    assert_eq!(state.artifacts.timing.first().unwrap().start, 0.0);

    let order: Vec<StageId> = state.stages.iter().map(|r| r.stage).collect();
    assert_eq!(
        order,
        vec![
            StageId::Normalize,
            StageId::VoicePrep,
            StageId::Lyrics,
            StageId::Synthesis,
            StageId::Beat,
            StageId::Mix,
            StageId::Align,
            StageId::Video,
        ]
    );

    let result = terminal.result.unwrap();
    assert_eq!(result.audio_url, format!("/outputs/{}", mixed));
    assert_eq!(result.waveform.len(), 200);

    // Two bars per generated verse, each inside its verse interval.
    assert_eq!(result.bars.len(), 8);
    for bar in &result.bars {
        let line = &result.timing[bar.verse];
        assert!(bar.start >= line.start && bar.end <= line.end && bar.end > bar.start);
    }
}

#[tokio::test]
async fn test_unavailable_primary_falls_back_without_calling_it() {
    let dir = TempDir::new().unwrap();
    let primary = Arc::new(MockVoice::new("hosted", ProviderTier::Primary, false));
    let fallback = Arc::new(MockVoice::new("local", ProviderTier::Fallback, true));
    let providers =
        ProviderSet::new(vec![primary.clone(), fallback.clone()]).with_text(lyricist());
    let orchestrator = BattleOrchestrator::new(test_config(dir.path()), providers);

    let battle_id = orchestrator.submit(request()).unwrap();
    let terminal = wait_for_terminal(&orchestrator, &battle_id).await;
    assert_eq!(terminal.status, BattleStatus::Complete);

    assert_eq!(primary.availability_checks.load(Ordering::SeqCst), 1);
    assert_eq!(primary.syntheses.load(Ordering::SeqCst), 0);
    assert_eq!(primary.clones.load(Ordering::SeqCst), 0);
    assert_eq!(fallback.syntheses.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_no_provider_available_fails_before_any_stage() {
    let dir = TempDir::new().unwrap();
    let providers = ProviderSet::new(vec![
        Arc::new(MockVoice::new("hosted", ProviderTier::Primary, false)),
        Arc::new(MockVoice::new("local", ProviderTier::Fallback, false)),
    ])
    .with_text(lyricist());
    let orchestrator = BattleOrchestrator::new(test_config(dir.path()), providers);

    let battle_id = orchestrator.submit(request()).unwrap();
    let terminal = wait_for_terminal(&orchestrator, &battle_id).await;
    assert_eq!(terminal.status, BattleStatus::Failed);

    let error = terminal.error.unwrap();
    assert_eq!(error.kind, ErrorKind::NoProviderAvailable);
    assert_eq!(error.stage, Some(StageId::VoicePrep));
    assert!(error.message.contains("hosted, local"));

    let state = orchestrator.get_state(&battle_id).unwrap();
    assert!(
        state
            .stages
            .iter()
            .all(|r| r.status != StageStatus::Succeeded)
    );
}

#[tokio::test]
async fn test_synthesis_timeout_fails_with_timeout_kind() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.timeouts.voice_secs = 1;
    let voice = Arc::new(
        MockVoice::new("slow", ProviderTier::Primary, true).with_delay(Duration::from_secs(5)),
    );
    let providers = ProviderSet::new(vec![voice]).with_text(lyricist());
    let orchestrator = BattleOrchestrator::new(config, providers);

    let battle_id = orchestrator.submit(request()).unwrap();
    let terminal = wait_for_terminal(&orchestrator, &battle_id).await;
    assert_eq!(terminal.status, BattleStatus::Failed);

    let error = terminal.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert_eq!(error.stage, Some(StageId::Synthesis));
    assert!(error.message.contains("timed out after 1s"));

    let state = orchestrator.get_state(&battle_id).unwrap();
    assert_eq!(stage_status(&state, StageId::Synthesis), Some(StageStatus::Failed));
    assert_eq!(stage_status(&state, StageId::Beat), None);
}

#[tokio::test]
async fn test_provider_error_fails_the_stage_and_stops() {
    let dir = TempDir::new().unwrap();
    let voice = Arc::new(MockVoice::new("broken", ProviderTier::Primary, true).failing());
    let providers = ProviderSet::new(vec![voice]).with_text(lyricist());
    let orchestrator = BattleOrchestrator::new(test_config(dir.path()), providers);

    let battle_id = orchestrator.submit(request()).unwrap();
    let terminal = wait_for_terminal(&orchestrator, &battle_id).await;
    assert_eq!(terminal.status, BattleStatus::Failed);

    let error = terminal.error.unwrap();
    assert_eq!(error.kind, ErrorKind::StageFailed);
    assert_eq!(error.stage, Some(StageId::Synthesis));
    assert!(error.message.contains("voice engine crashed"));

    let state = orchestrator.get_state(&battle_id).unwrap();
    let synthesis = state.stage_result(StageId::Synthesis).unwrap();
    assert_eq!(synthesis.status, StageStatus::Failed);
    assert!(synthesis.error.as_deref().is_some_and(|e| !e.is_empty()));
    for later in [StageId::Beat, StageId::Mix, StageId::Align, StageId::Video] {
        assert_eq!(stage_status(&state, later), None, "{}", later);
    }
    assert!(state.artifacts.mixed_audio.is_none());
    assert!(terminal.result.is_none());
}

#[tokio::test]
async fn test_each_participant_is_cloned_once() {
    let dir = TempDir::new().unwrap();
    let sample_a = dir.path().join("nova.wav");
    let sample_b = dir.path().join("orbit.wav");
    tone(1.0, 24_000).write_wav(&sample_a).unwrap();
    tone(1.0, 24_000).write_wav(&sample_b).unwrap();

    let voice = Arc::new(MockVoice::new("primary", ProviderTier::Primary, true));
    let providers = ProviderSet::new(vec![voice.clone()]).with_text(lyricist());
    let orchestrator = BattleOrchestrator::new(test_config(dir.path().join("out").as_path()), providers);

    let mut battle = request().with_verse_count(5);
    battle.fighter_a = battle.fighter_a.with_voice_sample(&sample_a);
    battle.fighter_b = battle.fighter_b.with_voice_sample(&sample_b);

    let battle_id = orchestrator.submit(battle).unwrap();
    let terminal = wait_for_terminal(&orchestrator, &battle_id).await;
    assert_eq!(terminal.status, BattleStatus::Complete);
    assert_eq!(voice.clones.load(Ordering::SeqCst), 2);
    assert_eq!(voice.syntheses.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn test_provided_lyrics_skip_the_lyrics_stage() {
    let dir = TempDir::new().unwrap();
    let providers = ProviderSet::new(vec![Arc::new(MockVoice::new(
        "primary",
        ProviderTier::Primary,
        true,
    ))]);
    let orchestrator = BattleOrchestrator::new(test_config(dir.path()), providers);

    let mut battle = request();
    battle.fighter_a = battle
        .fighter_a
        .with_lyrics("first verse bar\nsecond bar\n\nfinal verse bar");
    battle.fighter_b = battle
        .fighter_b
        .with_lyrics("reply bar\n\nclosing bar\nlast word");

    let battle_id = orchestrator.submit(battle).unwrap();
    let terminal = wait_for_terminal(&orchestrator, &battle_id).await;
    assert_eq!(terminal.status, BattleStatus::Complete);

    let state = orchestrator.get_state(&battle_id).unwrap();
    let lyrics = state.stage_result(StageId::Lyrics).unwrap();
    assert_eq!(lyrics.status, StageStatus::Skipped);
    assert_eq!(lyrics.message, "Using provided lyrics");

    let texts: Vec<&str> = state.artifacts.verses.iter().map(|v| v.text.as_str()).collect();
    assert_eq!(
        texts,
        vec![
            "first verse bar\nsecond bar",
            "reply bar",
            "final verse bar",
            "closing bar\nlast word"
        ]
    );
}

#[tokio::test]
async fn test_cancel_during_synthesis_stops_the_pipeline() {
    let dir = TempDir::new().unwrap();
    let voice = Arc::new(
        MockVoice::new("slow", ProviderTier::Primary, true).with_delay(Duration::from_secs(30)),
    );
    let providers = ProviderSet::new(vec![voice.clone()]).with_text(lyricist());
    let orchestrator = BattleOrchestrator::new(test_config(dir.path()), providers);

    let battle_id = orchestrator.submit(request()).unwrap();
    let mut subscription = orchestrator.subscribe(&battle_id).unwrap();
    let terminal = tokio::time::timeout(Duration::from_secs(20), async {
        let mut cancelled = false;
        let mut last = None;
        while let Some(update) = subscription.next().await {
            let in_synthesis = update.stage == Some(StageId::Synthesis);
            if in_synthesis && !cancelled {
                assert_eq!(orchestrator.cancel(&battle_id).unwrap(), BattleStatus::InProgress);
                cancelled = true;
            }
            last = Some(update);
        }
        last.unwrap()
    })
    .await
    .expect("cancelled battle did not finish");

    assert_eq!(terminal.status, BattleStatus::Cancelled);
    assert_eq!(terminal.error.unwrap().kind, ErrorKind::Cancelled);

    let state = orchestrator.get_state(&battle_id).unwrap();
    assert_eq!(stage_status(&state, StageId::Synthesis), Some(StageStatus::Cancelled));
    assert_eq!(stage_status(&state, StageId::Beat), None);
    assert!(state.artifacts.mixed_audio.is_none());

    assert_eq!(
        orchestrator.cancel(&battle_id).unwrap(),
        BattleStatus::Cancelled
    );
}

#[tokio::test]
async fn test_video_stage_lipsyncs_each_speaker() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.video.public_base_url = Some("https://battles.example/".to_string());

    let lipsync = Arc::new(MockLipSync {
        audio_urls: Mutex::new(Vec::new()),
    });
    let providers = ProviderSet::new(vec![Arc::new(MockVoice::new(
        "primary",
        ProviderTier::Primary,
        true,
    ))])
    .with_text(lyricist())
    .with_lipsync(lipsync.clone());
    let orchestrator = BattleOrchestrator::new(config, providers);

    let mut battle = request().with_video();
    battle.fighter_a = battle.fighter_a.with_face("https://faces.example/nova");
    battle.fighter_b = battle.fighter_b.with_face("https://faces.example/orbit");

    let battle_id = orchestrator.submit(battle).unwrap();
    let terminal = wait_for_terminal(&orchestrator, &battle_id).await;
    assert_eq!(terminal.status, BattleStatus::Complete);

    let heads = terminal.result.unwrap().talking_heads;
    assert_eq!(heads.len(), 2);
    assert_eq!(heads[&Speaker::A], "https://faces.example/nova.mp4");

    let urls = lipsync.audio_urls.lock().unwrap().clone();
    assert_eq!(urls.len(), 2);
    assert!(urls.iter().all(|u| u.starts_with("https://battles.example/outputs/")));
}

#[tokio::test]
async fn test_test_mode_runs_one_verse_each_without_video() {
    let dir = TempDir::new().unwrap();
    let text = lyricist();
    let providers = ProviderSet::new(vec![Arc::new(MockVoice::new(
        "primary",
        ProviderTier::Primary,
        true,
    ))])
    .with_text(text.clone());
    let orchestrator = BattleOrchestrator::new(test_config(dir.path()), providers);

    let mut battle = request().with_verse_count(4).with_video();
    battle.test_mode = true;

    let battle_id = orchestrator.submit(battle).unwrap();
    let terminal = wait_for_terminal(&orchestrator, &battle_id).await;
    assert_eq!(terminal.status, BattleStatus::Complete);
    assert_eq!(text.calls.load(Ordering::SeqCst), 2);

    let state = orchestrator.get_state(&battle_id).unwrap();
    let video = state.stage_result(StageId::Video).unwrap();
    assert_eq!(video.status, StageStatus::Skipped);
}

#[tokio::test]
async fn test_invalid_request_is_rejected_synchronously() {
    let dir = TempDir::new().unwrap();
    let orchestrator = BattleOrchestrator::new(test_config(dir.path()), ProviderSet::default());

    let mut battle = request();
    battle.fighter_a.name = " ".to_string();
    battle.topic = String::new();

    match orchestrator.submit(battle) {
        Err(BattleError::Validation(errors)) => assert_eq!(errors.len(), 2),
        other => panic!("expected validation error, got {:?}", other),
    }
    assert_eq!(orchestrator.battle_count(), 0);
}

#[tokio::test]
async fn test_generate_lyrics_without_synthesis() {
    let dir = TempDir::new().unwrap();
    let voice = Arc::new(MockVoice::new("primary", ProviderTier::Primary, true));
    let text = lyricist();
    let providers = ProviderSet::new(vec![voice.clone()]).with_text(text.clone());
    let orchestrator = BattleOrchestrator::new(test_config(dir.path()), providers);

    let verses = orchestrator.generate_lyrics(&request()).await.unwrap();
    assert_eq!(verses.len(), 4);
    assert_eq!(verses[0].speaker, Speaker::A);
    assert_eq!(verses[1].speaker, Speaker::B);
    assert!(verses[2].finale && verses[3].finale);
    assert_eq!(voice.syntheses.load(Ordering::SeqCst), 0);
    assert_eq!(orchestrator.battle_count(), 0);
}

#[tokio::test]
async fn test_generate_lyrics_without_generator_fails_in_lyrics_stage() {
    let dir = TempDir::new().unwrap();
    let orchestrator = BattleOrchestrator::new(test_config(dir.path()), ProviderSet::default());

    let err = orchestrator.generate_lyrics(&request()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StageFailed);
    assert_eq!(err.stage(), Some(StageId::Lyrics));
}

#[tokio::test]
async fn test_expired_battles_are_evicted_with_artifacts() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.pipeline.retention_secs = 0;
    let providers = ProviderSet::new(vec![Arc::new(MockVoice::new(
        "primary",
        ProviderTier::Primary,
        true,
    ))])
    .with_text(lyricist());
    let orchestrator = BattleOrchestrator::new(config, providers);

    let battle_id = orchestrator.submit(request()).unwrap();
    wait_for_terminal(&orchestrator, &battle_id).await;
    let battle_dir = orchestrator.store().battle_dir(&battle_id);
    assert!(battle_dir.exists());

    assert_eq!(orchestrator.evict_expired(chrono::Utc::now()), 1);
    assert!(!battle_dir.exists());
    assert!(matches!(
        orchestrator.get_state(&battle_id),
        Err(BattleError::UnknownBattle(_))
    ));
}

#[tokio::test]
async fn test_remove_unknown_battle_is_not_found() {
    let dir = TempDir::new().unwrap();
    let orchestrator = BattleOrchestrator::new(test_config(dir.path()), ProviderSet::default());
    let err = orchestrator.remove(&BattleId::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
