//! Stage executor: bounded-concurrency execution of one stage's tasks.
//!
//! Items are admitted FIFO against a semaphore sized to the stage's
//! concurrency limit. Individual task failures are isolated; only a gate
//! abort cancels the pool. The stage settles only after every spawned task
//! has drained.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::admission::{Admission, AdmissionGate};
use super::controller::{RunState, RunStateHandle};
use super::registry::ActiveTaskRegistry;
use super::retry::{RetryConfig, RetryExecutor};
use super::task::{Task, TaskOutcome};
use crate::engine::{CommandSpec, TranscodeEngine};
use crate::error::Error;
use crate::events::{EventBus, PipelineEvent, ProgressReporter};
use crate::media::MediaItem;

/// Builds the engine command for one item in one stage. Owned by glue code;
/// opaque to the orchestration core.
pub trait CommandPlanner: Send + Sync {
    fn plan(&self, item: &MediaItem, dest_dir: &Path) -> CommandSpec;
}

/// One configured pipeline stage. Its ordinal is its position in the
/// controller's stage sequence.
#[derive(Clone)]
pub struct StageSpec {
    pub name: String,
    /// Progress weight; a configured pipeline's weights sum to 100.
    pub weight: u32,
    /// Concurrency limit for this stage's pool.
    pub concurrency: usize,
    pub planner: Arc<dyn CommandPlanner>,
    /// Whether the artifact replaces the item's path for downstream stages.
    /// Side-output stages (thumbnails) leave the item untouched.
    pub advances: bool,
    /// Whether artifacts are deliverables (output directory) or scratch
    /// intermediates (work directory, removed at cleanup).
    pub publish: bool,
}

impl StageSpec {
    pub fn new(
        name: impl Into<String>,
        weight: u32,
        concurrency: usize,
        planner: Arc<dyn CommandPlanner>,
    ) -> Self {
        Self {
            name: name.into(),
            weight,
            concurrency,
            planner,
            advances: true,
            publish: true,
        }
    }

    /// The artifact is auxiliary; items pass through unchanged.
    pub fn side_output(mut self) -> Self {
        self.advances = false;
        self
    }

    /// Artifacts are scratch input for a later stage, not deliverables.
    pub fn intermediate(mut self) -> Self {
        self.publish = false;
        self
    }
}

/// A failed item with its attempt count and final error.
#[derive(Debug, Clone)]
pub struct FailedTask {
    pub item: MediaItem,
    pub attempts: u32,
    pub error: String,
}

/// Result of executing one stage over its input set.
#[derive(Debug, Default)]
pub struct StageOutcome {
    pub succeeded: Vec<MediaItem>,
    pub failed: Vec<FailedTask>,
    /// Tasks cancelled plus items never admitted because of an abort.
    pub aborted: usize,
}

impl StageOutcome {
    pub fn was_aborted(&self) -> bool {
        self.aborted > 0
    }

    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.aborted
    }
}

/// Settled/total counters for one running stage, read by the controller's
/// progress heartbeat.
#[derive(Debug)]
pub struct StageProgress {
    settled: AtomicUsize,
    total: usize,
}

impl StageProgress {
    pub fn new(total: usize) -> Self {
        Self {
            settled: AtomicUsize::new(0),
            total,
        }
    }

    pub fn note_settled(&self) {
        self.settled.fetch_add(1, Ordering::SeqCst);
    }

    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            (self.settled.load(Ordering::SeqCst) as f32 / self.total as f32).min(1.0)
        }
    }
}

pub struct StageExecutor {
    engine: Arc<dyn TranscodeEngine>,
    gate: Arc<AdmissionGate>,
    registry: Arc<ActiveTaskRegistry>,
    retry: RetryConfig,
    events: EventBus,
}

impl StageExecutor {
    pub fn new(
        engine: Arc<dyn TranscodeEngine>,
        gate: Arc<AdmissionGate>,
        registry: Arc<ActiveTaskRegistry>,
        retry: RetryConfig,
        events: EventBus,
    ) -> Self {
        Self {
            engine,
            gate,
            registry,
            retry,
            events,
        }
    }

    /// Execute a stage over `items`, writing artifacts under `dest_dir`.
    pub async fn execute(
        &self,
        stage: &StageSpec,
        stage_index: usize,
        items: Vec<MediaItem>,
        dest_dir: &Path,
        progress: Arc<StageProgress>,
        state: &RunStateHandle,
    ) -> StageOutcome {
        let total = items.len();
        info!(stage = %stage.name, items = total, limit = stage.concurrency, "stage started");
        self.events.emit(PipelineEvent::StageStarted {
            stage: stage.name.clone(),
            items: total,
        });

        let stage_cancel = CancellationToken::new();
        let semaphore = Arc::new(Semaphore::new(stage.concurrency.max(1)));
        let mut join: JoinSet<(Task, TaskOutcome)> = JoinSet::new();
        let mut outcome = StageOutcome::default();
        let mut admission_aborted = false;
        let mut recheck = tokio::time::interval(self.gate.config().recheck_interval());
        recheck.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first interval tick is immediate; consume it so rechecks are
        // actually spaced out.
        recheck.tick().await;

        let mut queue = items.into_iter();
        'admit: for item in queue.by_ref() {
            if self.wait_for_admission(stage_index, state).await == Admission::Abort {
                admission_aborted = true;
                outcome.aborted += 1;
                break 'admit;
            }
            // Capacity wait; while saturated, re-consult the gate periodically.
            let permit = loop {
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        match permit {
                            Ok(permit) => break permit,
                            // The stage owns this semaphore and never closes
                            // it; treat a close as an abort all the same.
                            Err(_) => {
                                admission_aborted = true;
                                outcome.aborted += 1;
                                break 'admit;
                            }
                        }
                    }
                    _ = recheck.tick() => {
                        if self.gate.admit() == Admission::Abort {
                            admission_aborted = true;
                            outcome.aborted += 1;
                            break 'admit;
                        }
                    }
                }
            };
            // The permit wait may have outlived the last gate decision.
            if self.gate.admit() == Admission::Abort {
                admission_aborted = true;
                outcome.aborted += 1;
                break 'admit;
            }
            self.spawn_task(stage, item, dest_dir, permit, &stage_cancel, &mut join);
        }

        if admission_aborted {
            // Everything not yet admitted counts as aborted too.
            outcome.aborted += queue.count();
            stage_cancel.cancel();
        }

        // Barrier: every spawned task drains before the stage settles.
        while let Some(joined) = join.join_next().await {
            progress.note_settled();
            match joined {
                Ok((task, task_outcome)) => {
                    self.record(stage, task, task_outcome, &mut outcome);
                }
                Err(join_error) => {
                    warn!(stage = %stage.name, %join_error, "task panicked");
                    outcome.aborted += 1;
                }
            }
        }

        info!(
            stage = %stage.name,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            aborted = outcome.aborted,
            "stage finished"
        );
        self.events.emit(PipelineEvent::StageFinished {
            stage: stage.name.clone(),
            succeeded: outcome.succeeded.len(),
            failed: outcome.failed.len(),
            aborted: outcome.aborted,
        });
        outcome
    }

    fn spawn_task(
        &self,
        stage: &StageSpec,
        item: MediaItem,
        dest_dir: &Path,
        permit: OwnedSemaphorePermit,
        stage_cancel: &CancellationToken,
        join: &mut JoinSet<(Task, TaskOutcome)>,
    ) {
        let mut task = Task::new(item, stage.name.clone());
        let spec = stage.planner.plan(&task.item, dest_dir);
        let task_cancel = stage_cancel.child_token();
        self.registry.register(task.id, task_cancel.clone());
        let retry = RetryExecutor::new(self.engine.clone(), self.retry.clone());
        let registry = self.registry.clone();
        let reporter = ProgressReporter::new(self.events.clone(), stage.name.clone(), task.item.label());
        join.spawn(async move {
            let _permit = permit;
            task.start();
            if let Some(parent) = spec.output.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            let outcome = retry.run_with_retry(&spec, reporter, &task_cancel).await;
            registry.unregister(&task.id);
            if matches!(outcome, TaskOutcome::Failed { .. }) {
                cleanup_partial_artifact(&spec.output).await;
            }
            task.settle(&outcome);
            (task, outcome)
        });
    }

    fn record(
        &self,
        stage: &StageSpec,
        task: Task,
        task_outcome: TaskOutcome,
        outcome: &mut StageOutcome,
    ) {
        match task_outcome {
            TaskOutcome::Succeeded { artifact, attempts } => {
                self.events.emit(PipelineEvent::ItemSucceeded {
                    stage: task.stage.clone(),
                    item: task.item.label(),
                    attempts,
                });
                let item = if stage.advances {
                    task.item.advanced(artifact)
                } else {
                    task.item
                };
                outcome.succeeded.push(item);
            }
            TaskOutcome::Failed { error, attempts } => {
                let error = Error::Transcode {
                    stage: task.stage.clone(),
                    item: task.item.label(),
                    attempts,
                    source: error,
                };
                warn!(%error, "item failed");
                self.events.emit(PipelineEvent::ItemFailed {
                    stage: task.stage.clone(),
                    item: task.item.label(),
                    attempts,
                    error: error.to_string(),
                });
                outcome.failed.push(FailedTask {
                    item: task.item,
                    attempts,
                    error: error.to_string(),
                });
            }
            TaskOutcome::Aborted => {
                outcome.aborted += 1;
            }
        }
    }

    /// Cooldown-and-requery loop around the admission gate, bounded so
    /// sustained moderate load cannot stall a stage forever.
    async fn wait_for_admission(&self, stage_index: usize, state: &RunStateHandle) -> Admission {
        let config = self.gate.config();
        for cycle in 0..config.max_wait_cycles.max(1) {
            match self.gate.admit() {
                Admission::Proceed => {
                    if cycle > 0 {
                        state.set(RunState::Running { stage: stage_index });
                    }
                    return Admission::Proceed;
                }
                Admission::Abort => return Admission::Abort,
                Admission::WaitThenRetry => {
                    if cycle == 0 {
                        info!("system under load; pausing admission");
                    }
                    state.set(RunState::Paused { stage: stage_index });
                    tokio::time::sleep(config.cooldown()).await;
                }
            }
        }
        warn!(
            cycles = config.max_wait_cycles,
            "proceeding despite sustained load"
        );
        state.set(RunState::Running { stage: stage_index });
        Admission::Proceed
    }
}

/// Best-effort removal of a partial artifact left behind by a failed task.
async fn cleanup_partial_artifact(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!(path = %path.display(), "removed partial artifact"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "failed to remove partial artifact: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_progress_fraction() {
        let progress = StageProgress::new(4);
        assert_eq!(progress.fraction(), 0.0);
        progress.note_settled();
        progress.note_settled();
        assert_eq!(progress.fraction(), 0.5);
        progress.note_settled();
        progress.note_settled();
        assert_eq!(progress.fraction(), 1.0);
    }

    #[test]
    fn empty_stage_counts_as_done() {
        assert_eq!(StageProgress::new(0).fraction(), 1.0);
    }

    #[test]
    fn outcome_abort_flag() {
        let mut outcome = StageOutcome::default();
        assert!(!outcome.was_aborted());
        outcome.aborted = 2;
        assert!(outcome.was_aborted());
        assert_eq!(outcome.attempted(), 2);
    }
}
