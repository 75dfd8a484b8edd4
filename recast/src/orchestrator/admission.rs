//! Admission gate: load-based backpressure and critical-abort escalation.
//!
//! The gate is the only consumer of the monitor's threshold events. Warnings
//! are advisory; a critical disk event latches the gate, terminates every
//! in-flight task exactly once, and makes every later decision `Abort`.
//! Waiting cannot resolve disk exhaustion, so critical state never downgrades
//! within a run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use super::registry::ActiveTaskRegistry;
use crate::monitor::{Resource, ResourceMonitor, Severity, ThresholdEvent};

/// Admission decision for the next unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    WaitThenRetry,
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Cooldown between re-queries while the system is under load, in seconds.
    pub cooldown_secs: u64,
    /// Bounded number of cooldown cycles before proceeding anyway.
    pub max_wait_cycles: u32,
    /// How often a saturated pool re-consults the gate, in seconds.
    pub recheck_interval_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 5,
            max_wait_cycles: 6,
            recheck_interval_secs: 30,
        }
    }
}

impl AdmissionConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_secs(self.recheck_interval_secs)
    }

    pub fn with_cooldown_secs(mut self, secs: u64) -> Self {
        self.cooldown_secs = secs;
        self
    }

    pub fn with_max_wait_cycles(mut self, cycles: u32) -> Self {
        self.max_wait_cycles = cycles;
        self
    }

    pub fn with_recheck_interval_secs(mut self, secs: u64) -> Self {
        self.recheck_interval_secs = secs;
        self
    }
}

pub struct AdmissionGate {
    monitor: Arc<ResourceMonitor>,
    registry: Arc<ActiveTaskRegistry>,
    config: AdmissionConfig,
    critical: AtomicBool,
    abort_fired: AtomicBool,
    critical_event: Mutex<Option<ThresholdEvent>>,
}

impl AdmissionGate {
    /// Create a gate subscribed to the monitor's threshold events.
    pub fn new(
        monitor: Arc<ResourceMonitor>,
        registry: Arc<ActiveTaskRegistry>,
        config: AdmissionConfig,
    ) -> Arc<Self> {
        let mut events = monitor.subscribe();
        let gate = Arc::new(Self {
            monitor,
            registry,
            config,
            critical: AtomicBool::new(false),
            abort_fired: AtomicBool::new(false),
            critical_event: Mutex::new(None),
        });
        let weak = Arc::downgrade(&gate);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(gate) = weak.upgrade() else { break };
                        gate.observe(&event);
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });
        gate
    }

    /// Record a threshold event. The first critical disk breach latches the
    /// gate and terminates every in-flight task immediately; a pool may
    /// never consult the gate again once its last item was admitted, so the
    /// abort cannot wait for the next `admit()` call.
    pub fn observe(&self, event: &ThresholdEvent) {
        if event.severity == Severity::Critical
            && event.resource == Resource::Disk
            && !self.critical.swap(true, Ordering::SeqCst)
        {
            warn!(
                value = event.value,
                threshold = event.threshold,
                "critical disk threshold breached"
            );
            *self.critical_event.lock() = Some(event.clone());
            self.fire_abort_once();
        }
    }

    pub fn is_critical(&self) -> bool {
        self.critical.load(Ordering::SeqCst)
    }

    /// The event that latched the gate, if a critical breach occurred.
    pub fn critical_event(&self) -> Option<ThresholdEvent> {
        self.critical_event.lock().clone()
    }

    fn fire_abort_once(&self) {
        if !self.abort_fired.swap(true, Ordering::SeqCst) {
            let aborted = self.registry.abort_all();
            warn!(aborted, "terminated in-flight tasks after critical breach");
        }
    }

    /// Decide whether the next unit of work may start.
    pub fn admit(&self) -> Admission {
        if self.critical.load(Ordering::SeqCst) {
            self.fire_abort_once();
            return Admission::Abort;
        }
        let load = self.monitor.is_under_load();
        if load.cpu || load.memory {
            Admission::WaitThenRetry
        } else {
            Admission::Proceed
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;
    use crate::monitor::MonitorConfig;

    fn critical_disk() -> ThresholdEvent {
        ThresholdEvent {
            resource: Resource::Disk,
            value: 96.0,
            threshold: 95.0,
            severity: Severity::Critical,
        }
    }

    fn gate() -> (Arc<AdmissionGate>, Arc<ActiveTaskRegistry>) {
        let monitor = Arc::new(ResourceMonitor::new(MonitorConfig::default()));
        let registry = Arc::new(ActiveTaskRegistry::new());
        let gate = AdmissionGate::new(monitor, registry.clone(), AdmissionConfig::default());
        (gate, registry)
    }

    #[tokio::test]
    async fn idle_system_proceeds() {
        let (gate, _) = gate();
        assert_eq!(gate.admit(), Admission::Proceed);
        assert!(!gate.is_critical());
    }

    #[tokio::test]
    async fn critical_disk_latches_and_aborts_in_flight_work() {
        let (gate, registry) = gate();
        let token = CancellationToken::new();
        registry.register(Uuid::new_v4(), token.clone());

        // Observing the event is enough; no admit() call is required for the
        // in-flight work to be terminated.
        gate.observe(&critical_disk());
        assert!(gate.is_critical());
        assert!(token.is_cancelled());
        assert!(registry.is_empty());
        assert_eq!(gate.critical_event().map(|e| e.resource), Some(Resource::Disk));
        assert_eq!(gate.admit(), Admission::Abort);

        // A second decision stays Abort but does not re-fire the mass abort.
        registry.register(Uuid::new_v4(), CancellationToken::new());
        assert_eq!(gate.admit(), Admission::Abort);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn warnings_do_not_latch() {
        let (gate, _) = gate();
        gate.observe(&ThresholdEvent {
            resource: Resource::Memory,
            value: 92.0,
            threshold: 90.0,
            severity: Severity::Warning,
        });
        assert!(!gate.is_critical());
        assert_eq!(gate.admit(), Admission::Proceed);
    }
}
