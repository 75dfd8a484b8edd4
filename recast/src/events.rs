//! Pipeline event model and fire-and-forget broadcasting.
//!
//! Every observable fact about a run flows through one broadcast channel.
//! Emission never blocks and never fails the pipeline; a lagging subscriber
//! simply loses events.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::orchestrator::controller::RunState;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PipelineEvent {
    StateChanged {
        state: RunState,
    },
    ItemValidated {
        item: String,
    },
    ItemRejected {
        item: String,
        reason: String,
    },
    StageStarted {
        stage: String,
        items: usize,
    },
    StageFinished {
        stage: String,
        succeeded: usize,
        failed: usize,
        aborted: usize,
    },
    ItemProgress {
        stage: String,
        item: String,
        fraction: f32,
    },
    ItemSucceeded {
        stage: String,
        item: String,
        attempts: u32,
    },
    ItemFailed {
        stage: String,
        item: String,
        attempts: u32,
        error: String,
    },
    Progress {
        percent: f32,
        state: RunState,
        at: DateTime<Utc>,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all current subscribers. At-most-once delivery.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-item progress reporter handed to the transcoding engine.
///
/// Reports are fire-and-forget fractions in `[0, 1]`; dropping them is
/// always safe.
#[derive(Clone)]
pub struct ProgressReporter {
    stage: String,
    item: String,
    bus: Option<EventBus>,
}

impl ProgressReporter {
    pub fn new(bus: EventBus, stage: impl Into<String>, item: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            item: item.into(),
            bus: Some(bus),
        }
    }

    /// Reporter that discards everything.
    pub fn noop() -> Self {
        Self {
            stage: String::new(),
            item: String::new(),
            bus: None,
        }
    }

    pub fn report(&self, fraction: f32) {
        if let Some(bus) = &self.bus {
            bus.emit(PipelineEvent::ItemProgress {
                stage: self.stage.clone(),
                item: self.item.clone(),
                fraction: fraction.clamp(0.0, 1.0),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(PipelineEvent::ItemValidated {
            item: "a.mp4".into(),
        });
        match rx.recv().await.unwrap() {
            PipelineEvent::ItemValidated { item } => assert_eq!(item, "a.mp4"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        bus.emit(PipelineEvent::ItemValidated {
            item: "a.mp4".into(),
        });
    }

    #[tokio::test]
    async fn reporter_clamps_fractions() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let reporter = ProgressReporter::new(bus, "transcode", "a.mp4");
        reporter.report(1.7);
        match rx.recv().await.unwrap() {
            PipelineEvent::ItemProgress { fraction, .. } => assert_eq!(fraction, 1.0),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn noop_reporter_discards() {
        ProgressReporter::noop().report(0.5);
    }
}
