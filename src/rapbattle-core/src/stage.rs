//! Stage table and runner.
//!
//! The pipeline is a fixed, declared list of stages with explicit predecessor
//! sets. The runner starts every stage whose predecessors are done as one
//! concurrent wave, so voice preparation and lyric writing overlap. Per-verse
//! work runs concurrently inside a single stage and is reported as one
//! combined entry.

use std::fmt;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BattleError, StageFailure};

/// Identifier of one pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Normalize,
    VoicePrep,
    Lyrics,
    Synthesis,
    Beat,
    Mix,
    Align,
    Video,
}

impl StageId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Normalize => "normalize",
            StageId::VoicePrep => "voice_prep",
            StageId::Lyrics => "lyrics",
            StageId::Synthesis => "synthesis",
            StageId::Beat => "beat",
            StageId::Mix => "mix",
            StageId::Align => "align",
            StageId::Video => "video",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared stage: identity, dependencies and its share of overall progress.
#[derive(Debug, Clone, Copy)]
pub struct StageDescriptor {
    pub id: StageId,
    pub label: &'static str,
    pub predecessors: &'static [StageId],
    /// Overall progress (0-100) when the stage starts.
    pub progress_start: f32,
    /// Overall progress (0-100) when the stage ends.
    pub progress_end: f32,
}

/// The battle pipeline in execution order.
pub const STAGE_TABLE: [StageDescriptor; 8] = [
    StageDescriptor {
        id: StageId::Normalize,
        label: "Normalizing inputs",
        predecessors: &[],
        progress_start: 0.0,
        progress_end: 2.0,
    },
    StageDescriptor {
        id: StageId::VoicePrep,
        label: "Preparing voice samples",
        predecessors: &[StageId::Normalize],
        progress_start: 2.0,
        progress_end: 5.0,
    },
    StageDescriptor {
        id: StageId::Lyrics,
        label: "Writing lyrics",
        predecessors: &[StageId::Normalize],
        progress_start: 5.0,
        progress_end: 20.0,
    },
    StageDescriptor {
        id: StageId::Synthesis,
        label: "Synthesizing verses",
        predecessors: &[StageId::VoicePrep, StageId::Lyrics],
        progress_start: 20.0,
        progress_end: 50.0,
    },
    StageDescriptor {
        id: StageId::Beat,
        label: "Generating beat",
        predecessors: &[StageId::Synthesis],
        progress_start: 50.0,
        progress_end: 58.0,
    },
    StageDescriptor {
        id: StageId::Mix,
        label: "Mixing vocals and beat",
        predecessors: &[StageId::Synthesis, StageId::Beat],
        progress_start: 58.0,
        progress_end: 65.0,
    },
    StageDescriptor {
        id: StageId::Align,
        label: "Aligning lyrics and sampling waveform",
        predecessors: &[StageId::Mix],
        progress_start: 65.0,
        progress_end: 70.0,
    },
    StageDescriptor {
        id: StageId::Video,
        label: "Rendering talking heads",
        predecessors: &[StageId::Mix, StageId::Align],
        progress_start: 70.0,
        progress_end: 100.0,
    },
];

/// Look up a stage descriptor in the default table.
pub fn descriptor(id: StageId) -> &'static StageDescriptor {
    STAGE_TABLE
        .iter()
        .find(|d| d.id == id)
        .unwrap_or(&STAGE_TABLE[0])
}

/// Status of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StageStatus::Pending | StageStatus::Running)
    }

    /// Whether dependents may run after a stage in this status.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, StageStatus::Succeeded | StageStatus::Skipped)
    }
}

/// Recorded outcome of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageId,
    pub status: StageStatus,
    pub message: String,
    pub artifact: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl StageResult {
    pub fn pending(stage: StageId) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            message: String::new(),
            artifact: None,
            error: None,
            started_at: None,
            finished_at: None,
            duration_ms: None,
        }
    }

    fn start(&mut self, message: &str) {
        self.status = StageStatus::Running;
        self.message = message.to_string();
        self.started_at = Some(Utc::now());
    }

    fn finish(&mut self, status: StageStatus, started: Option<Instant>) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.duration_ms = started.map(|s| s.elapsed().as_millis() as u64);
    }
}

/// What a stage produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Completed {
        message: String,
        artifact: Option<String>,
    },
    /// Decided at run time that there is nothing to do.
    Skipped { reason: String },
}

impl StageOutcome {
    pub fn completed(message: impl Into<String>) -> Self {
        StageOutcome::Completed {
            message: message.into(),
            artifact: None,
        }
    }

    pub fn with_artifact(message: impl Into<String>, artifact: impl Into<String>) -> Self {
        StageOutcome::Completed {
            message: message.into(),
            artifact: Some(artifact.into()),
        }
    }
}

/// Executes stages and observes their transitions.
///
/// Stages of one wave run concurrently against a shared handler, so every
/// method takes `&self`. `record` is the single place stage results are
/// written; implementations publish them to the battle state and progress
/// channel.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Return a reason to skip the stage without running it.
    fn skip_reason(&self, stage: StageId) -> Option<String>;

    async fn run_stage(&self, stage: StageId) -> Result<StageOutcome, StageFailure>;

    fn record(&self, descriptor: &StageDescriptor, result: &StageResult);
}

/// Walks a stage table against a handler.
pub struct StageRunner {
    table: &'static [StageDescriptor],
    cancel: CancellationToken,
}

impl StageRunner {
    /// Build a runner, checking that every predecessor is declared earlier.
    pub fn new(
        table: &'static [StageDescriptor],
        cancel: CancellationToken,
    ) -> Result<Self, BattleError> {
        validate_table(table)?;
        Ok(Self { table, cancel })
    }

    /// Run the table in waves. Each wave holds every pending stage whose
    /// predecessors have all succeeded or been skipped; its stages start in
    /// declared order and run concurrently. Stops at the first failure or
    /// cancellation, marking stages still in flight as cancelled.
    ///
    /// Returns the results in declared order.
    pub async fn run<H: StageHandler>(&self, handler: &H) -> Result<Vec<StageResult>, BattleError> {
        let mut done: Vec<Option<StageResult>> = vec![None; self.table.len()];

        while done.iter().any(Option::is_none) {
            if self.cancel.is_cancelled() {
                info!("cancellation observed at stage boundary");
                return Err(BattleError::Cancelled);
            }

            let wave = self.ready(&done);
            if wave.is_empty() {
                let (descriptor, pred) = self.first_blocked(&done);
                return Err(BattleError::StageFailed {
                    stage: descriptor.id,
                    cause: StageFailure::Invalid(format!("predecessor '{}' has not completed", pred)),
                });
            }

            let mut running = Vec::with_capacity(wave.len());
            for index in wave {
                let descriptor = &self.table[index];
                let mut result = StageResult::pending(descriptor.id);
                if let Some(reason) = handler.skip_reason(descriptor.id) {
                    debug!(stage = %descriptor.id, %reason, "skipping stage");
                    result.message = reason;
                    result.finish(StageStatus::Skipped, None);
                    handler.record(descriptor, &result);
                    done[index] = Some(result);
                    continue;
                }
                result.start(&format!("{}...", descriptor.label));
                handler.record(descriptor, &result);
                running.push((index, result, Instant::now()));
            }

            self.run_wave(handler, running, &mut done).await?;
        }

        Ok(done.into_iter().flatten().collect())
    }

    /// Indices of pending stages whose predecessors all allow dependents.
    fn ready(&self, done: &[Option<StageResult>]) -> Vec<usize> {
        self.table
            .iter()
            .enumerate()
            .filter(|(i, _)| done[*i].is_none())
            .filter(|(_, descriptor)| {
                descriptor
                    .predecessors
                    .iter()
                    .all(|pred| self.satisfied(done, *pred))
            })
            .map(|(i, _)| i)
            .collect()
    }

    fn satisfied(&self, done: &[Option<StageResult>], stage: StageId) -> bool {
        done.iter()
            .flatten()
            .any(|r| r.stage == stage && r.status.satisfies_dependents())
    }

    fn first_blocked(&self, done: &[Option<StageResult>]) -> (&'static StageDescriptor, StageId) {
        let table = self.table;
        table
            .iter()
            .enumerate()
            .filter(|(i, _)| done[*i].is_none())
            .find_map(|(_, descriptor)| {
                descriptor
                    .predecessors
                    .iter()
                    .find(|pred| !self.satisfied(done, **pred))
                    .map(|pred| (descriptor, *pred))
            })
            .unwrap_or((&table[0], table[0].id))
    }

    async fn run_wave<H: StageHandler>(
        &self,
        handler: &H,
        mut running: Vec<(usize, StageResult, Instant)>,
        done: &mut [Option<StageResult>],
    ) -> Result<(), BattleError> {
        let mut pending: FuturesUnordered<_> = running
            .iter()
            .map(|(index, _, _)| {
                let index = *index;
                let stage = self.table[index].id;
                async move { (index, handler.run_stage(stage).await) }
            })
            .collect();

        while !pending.is_empty() {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                Some(next) = pending.next() => Some(next),
            };

            let Some((index, outcome)) = next else {
                drop(pending);
                self.abandon(handler, running, "Cancelled");
                return Err(BattleError::Cancelled);
            };

            let Some(position) = running.iter().position(|(i, _, _)| *i == index) else {
                continue;
            };
            let (_, mut result, started) = running.swap_remove(position);
            let descriptor = &self.table[index];

            match outcome {
                Ok(StageOutcome::Completed { message, artifact }) => {
                    result.message = message;
                    result.artifact = artifact;
                    result.finish(StageStatus::Succeeded, Some(started));
                    debug!(stage = %descriptor.id, duration_ms = ?result.duration_ms, "stage succeeded");
                }
                Ok(StageOutcome::Skipped { reason }) => {
                    result.message = reason;
                    result.finish(StageStatus::Skipped, Some(started));
                }
                Err(cause) => {
                    warn!(stage = %descriptor.id, error = %cause, "stage failed");
                    result.message = format!("{} failed", descriptor.label);
                    result.error = Some(cause.to_string());
                    result.finish(StageStatus::Failed, Some(started));
                    handler.record(descriptor, &result);
                    drop(pending);
                    self.abandon(handler, running, &format!("Stopped after '{}' failed", descriptor.id));
                    return Err(BattleError::StageFailed {
                        stage: descriptor.id,
                        cause,
                    });
                }
            }
            handler.record(descriptor, &result);
            done[index] = Some(result);
        }
        Ok(())
    }

    /// Mark stages still in flight as cancelled, in declared order.
    fn abandon<H: StageHandler>(
        &self,
        handler: &H,
        mut running: Vec<(usize, StageResult, Instant)>,
        message: &str,
    ) {
        running.sort_by_key(|(index, _, _)| *index);
        for (index, mut result, started) in running {
            let descriptor = &self.table[index];
            info!(stage = %descriptor.id, "stage abandoned");
            result.message = message.to_string();
            result.finish(StageStatus::Cancelled, Some(started));
            handler.record(descriptor, &result);
        }
    }
}

/// Every predecessor must appear earlier in the table, and ids are unique.
pub fn validate_table(table: &[StageDescriptor]) -> Result<(), BattleError> {
    for (i, descriptor) in table.iter().enumerate() {
        if table[..i].iter().any(|d| d.id == descriptor.id) {
            return Err(BattleError::Config(format!(
                "stage '{}' is declared twice",
                descriptor.id
            )));
        }
        for pred in descriptor.predecessors {
            if !table[..i].iter().any(|d| d.id == *pred) {
                return Err(BattleError::Config(format!(
                    "stage '{}' depends on '{}' which is not declared before it",
                    descriptor.id, pred
                )));
            }
        }
    }
    Ok(())
}
