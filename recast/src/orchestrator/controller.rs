//! Pipeline controller: stage sequencing, weighted progress, and guaranteed
//! cleanup.
//!
//! One controller drives one run. The stage sequence is fixed up front; each
//! stage acts as a barrier, so no task of stage N+1 starts before every task
//! of stage N settled. A heartbeat task emits the overall progress fraction
//! at a fixed interval regardless of work completion.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::executor::{StageExecutor, StageProgress, StageSpec};
use crate::error::Result;
use crate::events::{EventBus, PipelineEvent};
use crate::media::{self, MediaItem, MediaProber};

/// Overall run state. `Paused` retains the stage index so a resume continues
/// exactly where admission stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Validating,
    Running { stage: usize },
    Paused { stage: usize },
    Completed,
    Failed,
    Aborted,
}

/// Shared writer for the run state watch channel. Observers subscribe;
/// every distinct transition is also broadcast as a pipeline event.
#[derive(Clone)]
pub struct RunStateHandle {
    tx: Arc<watch::Sender<RunState>>,
    events: Option<EventBus>,
}

impl RunStateHandle {
    fn new(tx: watch::Sender<RunState>, events: EventBus) -> Self {
        Self {
            tx: Arc::new(tx),
            events: Some(events),
        }
    }

    /// Handle without observers, for driving an executor directly.
    pub fn detached() -> Self {
        let (tx, _rx) = watch::channel(RunState::Idle);
        Self {
            tx: Arc::new(tx),
            events: None,
        }
    }

    pub fn set(&self, state: RunState) {
        let previous = self.tx.send_replace(state);
        if previous != state
            && let Some(events) = &self.events
        {
            events.emit(PipelineEvent::StateChanged { state });
        }
    }

    pub fn get(&self) -> RunState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Final artifacts land here.
    pub output_dir: PathBuf,
    /// Scratch directory for intermediate stage artifacts.
    pub work_dir: PathBuf,
    /// Progress heartbeat interval in milliseconds.
    pub heartbeat_ms: u64,
    /// Remove the scratch directory when the run exits.
    pub cleanup_on_exit: bool,
}

impl PipelineConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        let output_dir = output_dir.into();
        let work_dir = output_dir.join(".recast-work");
        Self {
            output_dir,
            work_dir,
            heartbeat_ms: 1000,
            cleanup_on_exit: true,
        }
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_heartbeat_ms(mut self, ms: u64) -> Self {
        self.heartbeat_ms = ms;
        self
    }

    pub fn with_cleanup_on_exit(mut self, cleanup: bool) -> Self {
        self.cleanup_on_exit = cleanup;
        self
    }
}

/// Terminal result of one pipeline run.
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    /// Every stage finished; carries the items that survived all stages.
    Completed(Vec<MediaItem>),
    /// A stage left no survivors, or nothing validated.
    Failed(String),
    /// A critical resource breach terminated the run.
    Aborted,
}

#[derive(Default)]
struct ProgressInner {
    completed_weight: f32,
    current: Option<(f32, Arc<StageProgress>)>,
}

/// Weighted overall progress shared with the heartbeat task.
struct ProgressTracker {
    total_weight: f32,
    inner: Mutex<ProgressInner>,
}

impl ProgressTracker {
    fn new(total_weight: u32) -> Self {
        Self {
            total_weight: total_weight as f32,
            inner: Mutex::new(ProgressInner::default()),
        }
    }

    fn begin_stage(&self, weight: u32, progress: Arc<StageProgress>) {
        self.inner.lock().current = Some((weight as f32, progress));
    }

    fn finish_stage(&self) {
        let mut inner = self.inner.lock();
        if let Some((weight, _)) = inner.current.take() {
            inner.completed_weight += weight;
        }
    }

    fn percent(&self) -> f32 {
        let inner = self.inner.lock();
        let mut done = inner.completed_weight;
        if let Some((weight, stage)) = &inner.current {
            done += weight * stage.fraction();
        }
        if self.total_weight == 0.0 {
            100.0
        } else {
            (done / self.total_weight * 100.0).min(100.0)
        }
    }
}

pub struct PipelineController {
    stages: Vec<StageSpec>,
    executor: StageExecutor,
    prober: Arc<dyn MediaProber>,
    events: EventBus,
    config: PipelineConfig,
    state: RunStateHandle,
    progress: Arc<ProgressTracker>,
    cleanup_done: AtomicBool,
}

struct StageReport {
    name: String,
    attempted: usize,
    succeeded: usize,
    failed: usize,
}

impl PipelineController {
    pub fn new(
        stages: Vec<StageSpec>,
        executor: StageExecutor,
        prober: Arc<dyn MediaProber>,
        events: EventBus,
        config: PipelineConfig,
    ) -> Self {
        let total_weight = stages.iter().map(|s| s.weight).sum();
        let (tx, _rx) = watch::channel(RunState::Idle);
        Self {
            stages,
            executor,
            prober,
            state: RunStateHandle::new(tx, events.clone()),
            events,
            config,
            progress: Arc::new(ProgressTracker::new(total_weight)),
            cleanup_done: AtomicBool::new(false),
        }
    }

    /// Watch the run state.
    pub fn state(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Run the full pipeline over `items`.
    ///
    /// Scoped cleanup of the work directory happens exactly once on every
    /// exit path, including errors.
    pub async fn run(&self, items: Vec<MediaItem>) -> Result<PipelineOutcome> {
        let heartbeat = self.spawn_heartbeat();
        let result = self.run_inner(items).await;
        heartbeat.cancel();
        self.cleanup().await;
        // Final emission so observers see the terminal percentage and state.
        self.emit_progress();
        result
    }

    async fn run_inner(&self, items: Vec<MediaItem>) -> Result<PipelineOutcome> {
        if self.stages.is_empty() {
            self.state.set(RunState::Failed);
            return Ok(PipelineOutcome::Failed("no stages configured".into()));
        }

        self.state.set(RunState::Validating);
        let validated = match media::validate_items(items, self.prober.clone(), &self.events).await
        {
            Ok(validated) => validated,
            // A crashed validation worker is pipeline-fatal; the run still
            // has to leave a terminal state behind for observers.
            Err(e) => {
                self.state.set(RunState::Failed);
                return Err(e);
            }
        };
        let valid: Vec<MediaItem> = validated.into_iter().filter(|i| i.is_valid()).collect();
        if valid.is_empty() {
            self.state.set(RunState::Failed);
            return Ok(PipelineOutcome::Failed("no valid items to process".into()));
        }
        info!(items = valid.len(), stages = self.stages.len(), "pipeline starting");
        self.emit_progress();

        let mut reports = Vec::with_capacity(self.stages.len());
        let mut current = valid;
        for (index, stage) in self.stages.iter().enumerate() {
            self.state.set(RunState::Running { stage: index });
            let stage_progress = Arc::new(StageProgress::new(current.len()));
            self.progress.begin_stage(stage.weight, stage_progress.clone());
            let dest_dir = if stage.publish {
                self.config.output_dir.clone()
            } else {
                self.config.work_dir.join(&stage.name)
            };
            let outcome = self
                .executor
                .execute(stage, index, current, &dest_dir, stage_progress, &self.state)
                .await;

            if outcome.was_aborted() {
                warn!(stage = %stage.name, "pipeline aborted");
                self.state.set(RunState::Aborted);
                return Ok(PipelineOutcome::Aborted);
            }
            if outcome.succeeded.is_empty() {
                let reason = format!(
                    "stage '{}' produced no surviving items ({} failed)",
                    stage.name,
                    outcome.failed.len()
                );
                self.state.set(RunState::Failed);
                return Ok(PipelineOutcome::Failed(reason));
            }

            reports.push(StageReport {
                name: stage.name.clone(),
                attempted: outcome.attempted(),
                succeeded: outcome.succeeded.len(),
                failed: outcome.failed.len(),
            });
            self.progress.finish_stage();
            self.emit_progress();
            current = outcome.succeeded;
        }

        self.state.set(RunState::Completed);
        for report in &reports {
            info!(
                stage = %report.name,
                attempted = report.attempted,
                succeeded = report.succeeded,
                failed = report.failed,
                "stage summary"
            );
        }
        info!(items = current.len(), "pipeline completed");
        Ok(PipelineOutcome::Completed(current))
    }

    fn spawn_heartbeat(&self) -> CancellationToken {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let events = self.events.clone();
        let progress = self.progress.clone();
        let state = self.state.clone();
        let period = Duration::from_millis(self.config.heartbeat_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                events.emit(PipelineEvent::Progress {
                    percent: progress.percent(),
                    state: state.get(),
                    at: Utc::now(),
                });
            }
        });
        cancel
    }

    fn emit_progress(&self) {
        self.events.emit(PipelineEvent::Progress {
            percent: self.progress.percent(),
            state: self.state.get(),
            at: Utc::now(),
        });
    }

    /// Best-effort removal of the scratch directory, exactly once per run.
    async fn cleanup(&self) {
        if !self.config.cleanup_on_exit || self.cleanup_done.swap(true, Ordering::SeqCst) {
            return;
        }
        match tokio::fs::remove_dir_all(&self.config.work_dir).await {
            Ok(()) => info!(dir = %self.config.work_dir.display(), "removed work directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(dir = %self.config.work_dir.display(), "failed to remove work directory: {e}")
            }
        }
    }
}
