//! Per-battle progress fan-out with replay-on-join.
//!
//! A channel keeps the latest cumulative update behind a mutex and forwards
//! every published update over a `tokio::sync::broadcast` channel. Taking the
//! snapshot and creating the receiver happen under the same lock that
//! `publish` holds while sending, so a subscriber never misses or duplicates
//! an update around the moment it joins.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, trace};

use crate::battle::{BattleId, BattleState, BattleStatus, CompletionPayload, ErrorReport};
use crate::stage::{StageId, StageResult};

/// Cumulative snapshot of a battle's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub battle_id: BattleId,
    pub status: BattleStatus,
    pub stage: Option<StageId>,
    /// Overall progress in percent.
    pub progress: f32,
    pub message: String,
    pub detected_bpm: Option<f32>,
    pub error: Option<ErrorReport>,
    pub stages: Vec<StageResult>,
    /// Set on the first update a subscriber receives.
    #[serde(default)]
    pub replay: bool,
    /// Present on the terminal update of a completed battle.
    #[serde(default)]
    pub result: Option<CompletionPayload>,
}

impl ProgressUpdate {
    pub fn from_state(state: &BattleState) -> Self {
        Self {
            battle_id: state.battle_id,
            status: state.status,
            stage: state.stage,
            progress: state.progress,
            message: state.message.clone(),
            detected_bpm: state.artifacts.detected_bpm,
            error: state.error.clone(),
            stages: state.stages.clone(),
            replay: false,
            result: state.completion(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

struct Latest {
    update: ProgressUpdate,
    closed: bool,
}

/// Publisher side of a battle's progress stream.
pub struct ProgressChannel {
    latest: Mutex<Latest>,
    sender: broadcast::Sender<ProgressUpdate>,
}

impl ProgressChannel {
    /// `capacity` bounds how many updates a slow subscriber may fall behind.
    pub fn new(initial: ProgressUpdate, capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            latest: Mutex::new(Latest {
                update: initial,
                closed: false,
            }),
            sender,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Latest> {
        // A poisoned lock still holds a consistent snapshot.
        self.latest.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish an update. Never blocks on subscribers.
    ///
    /// Updates after the first terminal one are dropped so every subscriber
    /// sees at most one terminal update.
    pub fn publish(&self, update: ProgressUpdate) {
        let mut latest = self.lock();
        if latest.closed {
            trace!(battle_id = %update.battle_id, "update after terminal dropped");
            return;
        }
        latest.closed = update.is_terminal();
        latest.update = update.clone();
        // No receivers is not an error; the snapshot still serves late joiners.
        let _ = self.sender.send(update);
    }

    /// Latest cumulative update.
    pub fn latest(&self) -> ProgressUpdate {
        self.lock().update.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Join the stream. The first item is a replay of the latest update.
    pub fn subscribe(self: &Arc<Self>) -> ProgressSubscription {
        let latest = self.lock();
        let mut replay = latest.update.clone();
        replay.replay = true;
        let receiver = self.sender.subscribe();
        drop(latest);

        ProgressSubscription {
            channel: Arc::clone(self),
            replay: Some(replay),
            receiver,
            done: false,
        }
    }
}

/// Subscriber side of a progress channel.
pub struct ProgressSubscription {
    channel: Arc<ProgressChannel>,
    replay: Option<ProgressUpdate>,
    receiver: broadcast::Receiver<ProgressUpdate>,
    done: bool,
}

impl ProgressSubscription {
    /// Next update, or `None` once the terminal update has been delivered.
    pub async fn next(&mut self) -> Option<ProgressUpdate> {
        if self.done {
            return None;
        }
        if let Some(replay) = self.replay.take() {
            self.done = replay.is_terminal();
            return Some(replay);
        }

        loop {
            match self.receiver.recv().await {
                Ok(update) => {
                    self.done = update.is_terminal();
                    return Some(update);
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "progress subscriber lagged, skipping dropped updates");
                }
                Err(RecvError::Closed) => {
                    self.done = true;
                    let latest = self.channel.latest();
                    return latest.is_terminal().then_some(latest);
                }
            }
        }
    }

    /// Adapt into a `Stream` that ends after the terminal update.
    pub fn into_stream(mut self) -> impl Stream<Item = ProgressUpdate> + Send {
        async_stream::stream! {
            while let Some(update) = self.next().await {
                yield update;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battle::{BattleRequest, BeatStyle};
    use crate::participant::{DeliveryStyle, ParticipantInput};
    use crate::stage::STAGE_TABLE;
    use futures::StreamExt;
    use std::time::Duration;

    fn state() -> BattleState {
        BattleState::new(
            BattleId::new(),
            BattleRequest::new(
                ParticipantInput::new("Nova", DeliveryStyle::Grime),
                ParticipantInput::new("Orbit", DeliveryStyle::Drill),
                "space",
                BeatStyle::Trap,
            ),
        )
    }

    fn update_at(base: &ProgressUpdate, index: usize, status: BattleStatus) -> ProgressUpdate {
        let mut update = base.clone();
        update.status = status;
        update.stage = Some(STAGE_TABLE[index].id);
        update.progress = STAGE_TABLE[index].progress_end;
        update.message = format!("stage {}", index);
        update
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_replay_then_live_then_one_terminal() {
        let initial = ProgressUpdate::from_state(&state());
        let channel = ProgressChannel::new(initial.clone(), 16);

        for i in 0..3 {
            channel.publish(update_at(&initial, i, BattleStatus::InProgress));
        }

        let mut sub = channel.subscribe();
        for i in 3..7 {
            channel.publish(update_at(&initial, i, BattleStatus::InProgress));
        }
        channel.publish(update_at(&initial, 7, BattleStatus::Complete));
        channel.publish(update_at(&initial, 7, BattleStatus::Failed));

        let first = sub.next().await.unwrap();
        assert!(first.replay);
        assert_eq!(first.stage, Some(STAGE_TABLE[2].id));

        let mut live = Vec::new();
        while let Some(update) = sub.next().await {
            live.push(update);
        }
        assert_eq!(live.len(), 5);
        assert!(live.iter().all(|u| !u.replay));
        assert_eq!(live.iter().filter(|u| u.is_terminal()).count(), 1);
        assert_eq!(live.last().map(|u| u.status), Some(BattleStatus::Complete));
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_updates_arrive_in_publish_order() {
        let initial = ProgressUpdate::from_state(&state());
        let channel = ProgressChannel::new(initial.clone(), 16);
        let sub = channel.subscribe();

        let publisher = {
            let channel = Arc::clone(&channel);
            let initial = initial.clone();
            tokio::spawn(async move {
                for i in 0..7 {
                    channel.publish(update_at(&initial, i, BattleStatus::InProgress));
                    tokio::task::yield_now().await;
                }
                channel.publish(update_at(&initial, 7, BattleStatus::Complete));
            })
        };

        let received: Vec<ProgressUpdate> = sub.into_stream().collect().await;
        publisher.await.unwrap();

        assert!(received[0].replay);
        let progress: Vec<f32> = received[1..].iter().map(|u| u.progress).collect();
        let mut sorted = progress.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(progress, sorted);
        assert_eq!(received.last().map(|u| u.status), Some(BattleStatus::Complete));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_still_receives_terminal() {
        let initial = ProgressUpdate::from_state(&state());
        let channel = ProgressChannel::new(initial.clone(), 2);
        let mut sub = channel.subscribe();

        for round in 0..10 {
            channel.publish(update_at(&initial, round % 7, BattleStatus::InProgress));
        }
        channel.publish(update_at(&initial, 7, BattleStatus::Failed));

        let mut received = Vec::new();
        while let Some(update) = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
        {
            received.push(update);
        }
        assert!(received.len() < 12);
        assert_eq!(received.iter().filter(|u| u.is_terminal()).count(), 1);
        assert_eq!(received.last().map(|u| u.status), Some(BattleStatus::Failed));
    }

    #[tokio::test]
    async fn test_subscribe_after_terminal_replays_terminal_once() {
        let initial = ProgressUpdate::from_state(&state());
        let channel = ProgressChannel::new(initial.clone(), 4);
        channel.publish(update_at(&initial, 4, BattleStatus::Cancelled));

        let mut sub = channel.subscribe();
        let replay = sub.next().await.unwrap();
        assert!(replay.replay);
        assert_eq!(replay.status, BattleStatus::Cancelled);
        assert!(sub.next().await.is_none());
    }

    #[test]
    fn test_publish_without_subscribers_updates_snapshot() {
        let initial = ProgressUpdate::from_state(&state());
        let channel = ProgressChannel::new(initial.clone(), 4);
        channel.publish(update_at(&initial, 1, BattleStatus::InProgress));
        assert_eq!(channel.latest().stage, Some(StageId::VoicePrep));
        assert_eq!(channel.subscriber_count(), 0);
    }
}
