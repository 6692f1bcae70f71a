//! Battle orchestration.
//!
//! Owns the keyed registry of battles. Each accepted battle gets one worker
//! task, which is the only writer of that battle's state; every other caller
//! reads cloned snapshots.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::ArtifactStore;
use crate::battle::{BattleId, BattleRequest, BattleState, BattleStatus, ErrorReport, Verse};
use crate::config::Config;
use crate::error::{BattleError, StageFailure};
use crate::lyrics;
use crate::progress::{ProgressChannel, ProgressSubscription, ProgressUpdate};
use crate::provider::{
    HostedLipSync, HostedVoice, KokoroVoice, LipSyncProvider, OpenAiLyricist, TextGenerator,
    VoiceProvider,
};
use crate::stage::{StageId, descriptor};
use crate::worker;

/// Secrets read from the environment.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub text_api_key: Option<String>,
    pub text_api_base: Option<String>,
    pub voice_api_key: Option<String>,
    pub lipsync_api_key: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            text_api_key: var("OPENAI_API_KEY"),
            text_api_base: var("OPENAI_API_BASE"),
            voice_api_key: var("VOICE_API_KEY"),
            lipsync_api_key: var("LIPSYNC_API_KEY"),
        }
    }
}

/// External providers available to battles.
#[derive(Clone, Default)]
pub struct ProviderSet {
    /// Voice providers in priority order.
    pub voices: Vec<Arc<dyn VoiceProvider>>,
    pub text: Option<Arc<dyn TextGenerator>>,
    pub lipsync: Option<Arc<dyn LipSyncProvider>>,
}

impl ProviderSet {
    pub fn new(voices: Vec<Arc<dyn VoiceProvider>>) -> Self {
        Self {
            voices,
            text: None,
            lipsync: None,
        }
    }

    pub fn with_text(mut self, text: Arc<dyn TextGenerator>) -> Self {
        self.text = Some(text);
        self
    }

    pub fn with_lipsync(mut self, lipsync: Arc<dyn LipSyncProvider>) -> Self {
        self.lipsync = Some(lipsync);
        self
    }

    /// Build the production providers: hosted voice first, local kokoro as
    /// fallback, OpenAI-compatible lyrics and hosted lip-sync.
    pub fn from_config(config: &Config, credentials: &Credentials) -> Result<Self, BattleError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BattleError::Config(format!("Failed to create HTTP client: {}", e)))?;

        let voices: Vec<Arc<dyn VoiceProvider>> = vec![
            Arc::new(HostedVoice::new(
                &config.voice,
                credentials.voice_api_key.clone(),
                http_client.clone(),
            )),
            Arc::new(KokoroVoice::new(config.voice.clone())),
        ];

        let text = match &credentials.text_api_key {
            Some(api_key) => {
                let mut text_config = config.text.clone();
                if let Some(base) = &credentials.text_api_base {
                    text_config.api_base = base.clone();
                }
                let lyricist = OpenAiLyricist::new(&text_config, api_key, config.timeouts.text())?;
                Some(Arc::new(lyricist) as Arc<dyn TextGenerator>)
            }
            None => None,
        };

        let lipsync: Arc<dyn LipSyncProvider> = Arc::new(HostedLipSync::new(
            &config.video,
            credentials.lipsync_api_key.clone(),
            http_client,
        ));

        Ok(Self {
            voices,
            text,
            lipsync: Some(lipsync),
        })
    }
}

/// Registry entry for one battle.
pub(crate) struct BattleEntry {
    state: RwLock<BattleState>,
    channel: Arc<ProgressChannel>,
    pub(crate) cancel: CancellationToken,
    removed: AtomicBool,
}

impl BattleEntry {
    fn read(&self) -> RwLockReadGuard<'_, BattleState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BattleState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn snapshot(&self) -> BattleState {
        self.read().clone()
    }

    /// Apply a change and publish the resulting cumulative update.
    ///
    /// Publishing under the state lock keeps updates in commit order.
    pub(crate) fn commit<R>(&self, change: impl FnOnce(&mut BattleState) -> R) -> R {
        let mut state = self.write();
        let result = change(&mut state);
        self.channel.publish(ProgressUpdate::from_state(&state));
        result
    }

    /// Report progress within a running stage. `fraction` is in [0, 1].
    pub(crate) fn report(&self, stage: StageId, fraction: f32, message: impl Into<String>) {
        let band = descriptor(stage);
        let progress =
            band.progress_start + (band.progress_end - band.progress_start) * fraction.clamp(0.0, 1.0);
        let message = message.into();
        self.commit(|state| {
            state.stage = Some(stage);
            state.progress = state.progress.max(progress);
            state.message = message;
        });
    }
}

pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) providers: ProviderSet,
    pub(crate) store: ArtifactStore,
    battles: RwLock<HashMap<BattleId, Arc<BattleEntry>>>,
}

impl Inner {
    fn battles(&self) -> RwLockReadGuard<'_, HashMap<BattleId, Arc<BattleEntry>>> {
        self.battles.read().unwrap_or_else(|e| e.into_inner())
    }

    fn battles_mut(&self) -> RwLockWriteGuard<'_, HashMap<BattleId, Arc<BattleEntry>>> {
        self.battles.write().unwrap_or_else(|e| e.into_inner())
    }

    fn entry(&self, battle_id: &BattleId) -> Result<Arc<BattleEntry>, BattleError> {
        self.battles()
            .get(battle_id)
            .cloned()
            .ok_or_else(|| BattleError::UnknownBattle(battle_id.to_string()))
    }

    fn remove_artifacts(&self, battle_id: &BattleId) {
        if let Err(e) = self.store.remove_battle(battle_id) {
            warn!(%battle_id, error = %e, "failed to remove battle artifacts");
        }
    }
}

/// Handle to the battle pipeline. Cheap to clone.
#[derive(Clone)]
pub struct BattleOrchestrator {
    inner: Arc<Inner>,
}

impl BattleOrchestrator {
    pub fn new(config: Config, providers: ProviderSet) -> Self {
        let store = ArtifactStore::new(config.pipeline.output_dir.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                providers,
                store,
                battles: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.inner.store
    }

    /// Validate and accept a battle, then start its worker.
    ///
    /// Validation failures are returned synchronously and nothing is registered.
    pub fn submit(&self, request: BattleRequest) -> Result<BattleId, BattleError> {
        request.validate()?;

        let battle_id = BattleId::new();
        let state = BattleState::new(battle_id, request);
        let channel = ProgressChannel::new(
            ProgressUpdate::from_state(&state),
            self.inner.config.pipeline.progress_capacity,
        );
        let entry = Arc::new(BattleEntry {
            state: RwLock::new(state),
            channel,
            cancel: CancellationToken::new(),
            removed: AtomicBool::new(false),
        });

        self.inner.battles_mut().insert(battle_id, Arc::clone(&entry));
        info!(%battle_id, "battle accepted");

        tokio::spawn(supervise(Arc::clone(&self.inner), entry, battle_id));
        Ok(battle_id)
    }

    /// Current snapshot of a battle.
    pub fn get_state(&self, battle_id: &BattleId) -> Result<BattleState, BattleError> {
        Ok(self.inner.entry(battle_id)?.snapshot())
    }

    /// Join a battle's progress stream; the first update is a replay.
    pub fn subscribe(&self, battle_id: &BattleId) -> Result<ProgressSubscription, BattleError> {
        Ok(self.inner.entry(battle_id)?.channel.subscribe())
    }

    /// Request cancellation. Idempotent; a finished battle is left as is.
    pub fn cancel(&self, battle_id: &BattleId) -> Result<BattleStatus, BattleError> {
        let entry = self.inner.entry(battle_id)?;
        let status = entry.read().status;
        if !status.is_terminal() {
            info!(%battle_id, "cancellation requested");
            entry.cancel.cancel();
        }
        Ok(status)
    }

    /// Drop a battle from the registry and delete its artifacts.
    ///
    /// A running battle is cancelled; its artifacts are deleted once the
    /// worker stops.
    pub fn remove(&self, battle_id: &BattleId) -> Result<(), BattleError> {
        let entry = self
            .inner
            .battles_mut()
            .remove(battle_id)
            .ok_or_else(|| BattleError::UnknownBattle(battle_id.to_string()))?;

        entry.removed.store(true, Ordering::SeqCst);
        entry.cancel.cancel();
        if entry.read().status.is_terminal() {
            self.inner.remove_artifacts(battle_id);
        }
        info!(%battle_id, "battle removed");
        Ok(())
    }

    /// Remove terminal battles whose retention window has passed at `now`.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let Some(retention) =
            chrono::Duration::try_seconds(self.inner.config.pipeline.retention_secs as i64)
        else {
            return 0;
        };

        let expired: Vec<BattleId> = self
            .inner
            .battles()
            .iter()
            .filter(|(_, entry)| {
                let state = entry.read();
                state.status.is_terminal()
                    && state.finished_at.is_some_and(|finished| finished + retention <= now)
            })
            .map(|(id, _)| *id)
            .collect();

        for battle_id in &expired {
            if self.inner.battles_mut().remove(battle_id).is_some() {
                self.inner.remove_artifacts(battle_id);
                debug!(%battle_id, "battle evicted");
            }
        }
        expired.len()
    }

    /// Periodically evict expired battles until the orchestrator is dropped.
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let evicted = BattleOrchestrator { inner }.evict_expired(Utc::now());
                if evicted > 0 {
                    info!(evicted, "expired battles evicted");
                }
            }
        })
    }

    /// Number of battles currently registered.
    pub fn battle_count(&self) -> usize {
        self.inner.battles().len()
    }

    /// Write the battle's verses without synthesizing anything.
    pub async fn generate_lyrics(&self, request: &BattleRequest) -> Result<Vec<Verse>, BattleError> {
        request.validate()?;
        lyrics::write_verses(
            self.inner.providers.text.as_deref(),
            request,
            &self.inner.config.prompts,
            self.inner.config.timeouts.text(),
        )
        .await
        .map_err(|cause| BattleError::StageFailed {
            stage: StageId::Lyrics,
            cause,
        })
    }
}

/// Run the worker and publish exactly one terminal status, even if the
/// worker panics.
async fn supervise(inner: Arc<Inner>, entry: Arc<BattleEntry>, battle_id: BattleId) {
    let worker = tokio::spawn(worker::drive(Arc::clone(&inner), Arc::clone(&entry)));

    let outcome = match worker.await {
        Ok(outcome) => outcome,
        Err(join_error) => {
            error!(%battle_id, error = %join_error, "battle worker crashed");
            let stage = entry.read().stage.unwrap_or(StageId::Normalize);
            Err(BattleError::StageFailed {
                stage,
                cause: StageFailure::Invalid(format!("battle worker crashed: {}", join_error)),
            })
        }
    };

    finish(&entry, &outcome);

    match &outcome {
        Ok(()) => info!(%battle_id, "battle complete"),
        Err(BattleError::Cancelled) => info!(%battle_id, "battle cancelled"),
        Err(e) => warn!(%battle_id, error = %e, "battle failed"),
    }

    if entry.removed.load(Ordering::SeqCst) {
        inner.remove_artifacts(&battle_id);
    }
}

fn finish(entry: &BattleEntry, outcome: &Result<(), BattleError>) {
    entry.commit(|state| {
        state.finished_at = Some(Utc::now());
        match outcome {
            Ok(()) => {
                state.status = BattleStatus::Complete;
                state.progress = 100.0;
                state.message = "Battle complete".to_string();
            }
            Err(err) => {
                state.status = if matches!(err, BattleError::Cancelled) {
                    BattleStatus::Cancelled
                } else {
                    BattleStatus::Failed
                };
                state.message = err.to_string();
                state.error = Some(ErrorReport::from(err));
            }
        }
    });
}
