//! Resource monitoring: system load sampling, moving averages, and
//! threshold events.
//!
//! One [`ResourceMonitor`] runs for the life of the process. A background
//! loop polls a [`ResourceProbe`] at a fixed interval, folds CPU readings
//! into a bounded moving average, and broadcasts [`ThresholdEvent`]s when
//! alert levels are crossed. Consumers read the latest snapshot; they never
//! sample the system themselves.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Resource dimensions tracked by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Cpu,
    Memory,
    Disk,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Cpu => write!(f, "CPU"),
            Resource::Memory => write!(f, "memory"),
            Resource::Disk => write!(f, "disk"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

/// Threshold breach broadcast on the monitor's event channel.
#[derive(Debug, Clone, Serialize)]
pub struct ThresholdEvent {
    pub resource: Resource,
    pub value: f32,
    pub threshold: f32,
    pub severity: Severity,
}

/// One raw sample from a probe. Percentages are `0..=100`.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
    pub disk_available_bytes: u64,
}

/// Latest computed view of system load.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSnapshot {
    pub taken_at: DateTime<Utc>,
    pub cpu_percent: f32,
    /// Moving average over the configured CPU window.
    pub cpu_average: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
    pub disk_available_bytes: u64,
}

/// Which load thresholds are currently exceeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnderLoad {
    pub cpu: bool,
    pub memory: bool,
    pub disk: bool,
}

impl UnderLoad {
    pub fn any(&self) -> bool {
        self.cpu || self.memory || self.disk
    }
}

/// Backpressure thresholds; exceeding these pauses admission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoadThresholds {
    pub cpu: f32,
    pub memory: f32,
    pub disk: f32,
}

impl Default for LoadThresholds {
    fn default() -> Self {
        Self {
            cpu: 70.0,
            memory: 80.0,
            disk: 90.0,
        }
    }
}

/// Alert thresholds; crossing these emits [`ThresholdEvent`]s. Crossing
/// `disk_critical` is unrecoverable for the current run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub cpu: f32,
    pub memory: f32,
    pub disk: f32,
    pub disk_critical: f32,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu: 85.0,
            memory: 90.0,
            disk: 90.0,
            disk_critical: 95.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Window over which a single CPU utilization reading is measured.
    pub cpu_sample_window_ms: u64,
    /// Number of CPU samples folded into the moving average.
    pub cpu_window_size: usize,
    pub load: LoadThresholds,
    pub alert: AlertThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            cpu_sample_window_ms: 1000,
            cpu_window_size: 10,
            load: LoadThresholds::default(),
            alert: AlertThresholds::default(),
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cpu_sample_window(&self) -> Duration {
        Duration::from_millis(self.cpu_sample_window_ms)
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_load(mut self, load: LoadThresholds) -> Self {
        self.load = load;
        self
    }

    pub fn with_alert(mut self, alert: AlertThresholds) -> Self {
        self.alert = alert;
        self
    }
}

/// Sampling backend. The production implementation reads sysinfo; tests
/// script their own samples.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn sample(&mut self) -> ResourceSample;
}

/// sysinfo-backed probe measuring the volume that holds the output directory.
pub struct SysinfoProbe {
    system: System,
    disks: Disks,
    output_dir: PathBuf,
    cpu_sample_window: Duration,
}

impl SysinfoProbe {
    pub fn new(output_dir: impl Into<PathBuf>, cpu_sample_window: Duration) -> Self {
        Self {
            system: System::new_with_specifics(
                RefreshKind::nothing()
                    .with_cpu(CpuRefreshKind::everything())
                    .with_memory(MemoryRefreshKind::everything()),
            ),
            disks: Disks::new_with_refreshed_list(),
            output_dir: output_dir.into(),
            cpu_sample_window,
        }
    }

    fn disk_usage(&mut self) -> (f32, u64) {
        self.disks.refresh(true);
        let path = self.output_dir.to_string_lossy();
        // Longest matching mount point wins (most specific volume).
        let mut best: Option<(&sysinfo::Disk, usize)> = None;
        for disk in self.disks.list() {
            let mount = disk.mount_point().to_string_lossy();
            if path.starts_with(mount.as_ref()) {
                let len = mount.len();
                if best.is_none_or(|(_, l)| len > l) {
                    best = Some((disk, len));
                }
            }
        }
        match best {
            Some((disk, _)) => {
                let total = disk.total_space();
                let available = disk.available_space();
                let percent = if total == 0 {
                    0.0
                } else {
                    (total.saturating_sub(available) as f64 / total as f64 * 100.0) as f32
                };
                (percent, available)
            }
            None => {
                warn!(dir = %self.output_dir.display(), "no disk found for output directory");
                (0.0, u64::MAX)
            }
        }
    }
}

#[async_trait]
impl ResourceProbe for SysinfoProbe {
    async fn sample(&mut self) -> ResourceSample {
        // CPU utilization over a short window: two refreshes bracketing a sleep.
        self.system.refresh_cpu_all();
        tokio::time::sleep(self.cpu_sample_window).await;
        self.system.refresh_cpu_all();
        self.system.refresh_memory();

        let cpu_percent = self.system.global_cpu_usage();
        let total = self.system.total_memory();
        let used = self.system.used_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            (used as f64 / total as f64 * 100.0) as f32
        };
        let (disk_percent, disk_available_bytes) = self.disk_usage();

        ResourceSample {
            cpu_percent,
            memory_percent,
            disk_percent,
            disk_available_bytes,
        }
    }
}

#[derive(Default)]
struct MonitorState {
    cpu_samples: VecDeque<f32>,
    latest: Option<ResourceSnapshot>,
}

pub struct ResourceMonitor {
    config: MonitorConfig,
    state: Arc<Mutex<MonitorState>>,
    event_tx: broadcast::Sender<ThresholdEvent>,
    cancel: CancellationToken,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            state: Arc::new(Mutex::new(MonitorState::default())),
            event_tx,
            cancel: CancellationToken::new(),
            poll_task: Mutex::new(None),
        }
    }

    /// Start the background poll loop. Starting an already-running monitor
    /// is a no-op.
    pub fn start(&self, mut probe: Box<dyn ResourceProbe>) {
        let mut guard = self.poll_task.lock();
        if guard.is_some() {
            warn!("resource monitor already started");
            return;
        }
        let state = self.state.clone();
        let config = self.config.clone();
        let event_tx = self.event_tx.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.poll_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let sample = probe.sample().await;
                let snapshot = record_sample(&state, &config, sample);
                emit_threshold_events(&config.alert, &snapshot, &event_tx);
            }
            debug!("resource monitor poll loop stopped");
        });
        *guard = Some(handle);
    }

    /// Stop the poll loop. Called once at shutdown.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.poll_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("resource monitor stopped");
    }

    pub fn snapshot(&self) -> Option<ResourceSnapshot> {
        self.state.lock().latest.clone()
    }

    /// Compare the latest snapshot against the load thresholds. CPU uses the
    /// moving average; memory and disk use the instantaneous reading. Before
    /// the first poll completes, nothing is under load.
    pub fn is_under_load(&self) -> UnderLoad {
        match self.snapshot() {
            None => UnderLoad::default(),
            Some(s) => UnderLoad {
                cpu: s.cpu_average > self.config.load.cpu,
                memory: s.memory_percent > self.config.load.memory,
                disk: s.disk_percent > self.config.load.disk,
            },
        }
    }

    /// Best-effort free space check on the monitored volume. Optimistic when
    /// no sample exists yet.
    pub fn check_free_space(&self, required_bytes: u64) -> bool {
        self.snapshot()
            .map(|s| s.disk_available_bytes >= required_bytes)
            .unwrap_or(true)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ThresholdEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }
}

fn record_sample(
    state: &Mutex<MonitorState>,
    config: &MonitorConfig,
    sample: ResourceSample,
) -> ResourceSnapshot {
    let mut st = state.lock();
    st.cpu_samples.push_back(sample.cpu_percent);
    while st.cpu_samples.len() > config.cpu_window_size.max(1) {
        st.cpu_samples.pop_front();
    }
    let cpu_average = st.cpu_samples.iter().sum::<f32>() / st.cpu_samples.len() as f32;
    let snapshot = ResourceSnapshot {
        taken_at: Utc::now(),
        cpu_percent: sample.cpu_percent,
        cpu_average,
        memory_percent: sample.memory_percent,
        disk_percent: sample.disk_percent,
        disk_available_bytes: sample.disk_available_bytes,
    };
    st.latest = Some(snapshot.clone());
    snapshot
}

fn emit_threshold_events(
    alert: &AlertThresholds,
    snapshot: &ResourceSnapshot,
    tx: &broadcast::Sender<ThresholdEvent>,
) {
    if snapshot.disk_percent >= alert.disk_critical {
        warn!(
            disk = snapshot.disk_percent,
            threshold = alert.disk_critical,
            "critical disk usage"
        );
        let _ = tx.send(ThresholdEvent {
            resource: Resource::Disk,
            value: snapshot.disk_percent,
            threshold: alert.disk_critical,
            severity: Severity::Critical,
        });
    } else if snapshot.disk_percent >= alert.disk {
        warn!(disk = snapshot.disk_percent, "high disk usage");
        let _ = tx.send(ThresholdEvent {
            resource: Resource::Disk,
            value: snapshot.disk_percent,
            threshold: alert.disk,
            severity: Severity::Warning,
        });
    }
    if snapshot.cpu_average >= alert.cpu {
        warn!(cpu = snapshot.cpu_average, "high CPU usage");
        let _ = tx.send(ThresholdEvent {
            resource: Resource::Cpu,
            value: snapshot.cpu_average,
            threshold: alert.cpu,
            severity: Severity::Warning,
        });
    }
    if snapshot.memory_percent >= alert.memory {
        warn!(memory = snapshot.memory_percent, "high memory usage");
        let _ = tx.send(ThresholdEvent {
            resource: Resource::Memory,
            value: snapshot.memory_percent,
            threshold: alert.memory,
            severity: Severity::Warning,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu: f32, memory: f32, disk: f32) -> ResourceSample {
        ResourceSample {
            cpu_percent: cpu,
            memory_percent: memory,
            disk_percent: disk,
            disk_available_bytes: 10 * 1024 * 1024 * 1024,
        }
    }

    struct ScriptedProbe {
        script: Vec<ResourceSample>,
        cursor: usize,
    }

    #[async_trait]
    impl ResourceProbe for ScriptedProbe {
        async fn sample(&mut self) -> ResourceSample {
            let s = self.script[self.cursor.min(self.script.len() - 1)];
            self.cursor += 1;
            s
        }
    }

    #[test]
    fn defaults_match_the_documented_thresholds() {
        let config = MonitorConfig::default();
        assert_eq!(config.poll_interval_ms, 5000);
        assert_eq!(config.cpu_window_size, 10);
        assert_eq!(config.load.cpu, 70.0);
        assert_eq!(config.load.memory, 80.0);
        assert_eq!(config.alert.disk_critical, 95.0);
    }

    #[test]
    fn cpu_moving_average_is_bounded() {
        let config = MonitorConfig {
            cpu_window_size: 3,
            ..Default::default()
        };
        let state = Mutex::new(MonitorState::default());
        for cpu in [10.0, 20.0, 30.0, 40.0] {
            record_sample(&state, &config, sample(cpu, 0.0, 0.0));
        }
        let snapshot = state.lock().latest.clone().unwrap();
        // Window holds [20, 30, 40].
        assert_eq!(snapshot.cpu_average, 30.0);
        assert_eq!(snapshot.cpu_percent, 40.0);
    }

    #[test]
    fn critical_disk_emits_a_critical_event() {
        let (tx, mut rx) = broadcast::channel(8);
        let config = MonitorConfig::default();
        let snapshot = record_sample(
            &Mutex::new(MonitorState::default()),
            &config,
            sample(10.0, 10.0, 96.0),
        );
        emit_threshold_events(&config.alert, &snapshot, &tx);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.resource, Resource::Disk);
        assert_eq!(event.severity, Severity::Critical);
        assert_eq!(event.threshold, 95.0);
    }

    #[test]
    fn warning_disk_stays_a_warning() {
        let (tx, mut rx) = broadcast::channel(8);
        let config = MonitorConfig::default();
        let snapshot = record_sample(
            &Mutex::new(MonitorState::default()),
            &config,
            sample(10.0, 10.0, 92.0),
        );
        emit_threshold_events(&config.alert, &snapshot, &tx);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.severity, Severity::Warning);
    }

    #[test]
    fn no_load_before_the_first_sample() {
        let monitor = ResourceMonitor::new(MonitorConfig::default());
        assert_eq!(monitor.is_under_load(), UnderLoad::default());
        assert!(monitor.snapshot().is_none());
        assert!(monitor.check_free_space(u64::MAX));
    }

    #[tokio::test]
    async fn poll_loop_records_snapshots_and_stops() {
        let monitor = ResourceMonitor::new(MonitorConfig::default().with_poll_interval_ms(10));
        monitor.start(Box::new(ScriptedProbe {
            script: vec![sample(50.0, 95.0, 20.0)],
            cursor: 0,
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let load = monitor.is_under_load();
        assert!(!load.cpu);
        assert!(load.memory);
        assert!(!load.disk);

        monitor.stop().await;
        assert!(monitor.poll_task.lock().is_none());
    }

    #[tokio::test]
    async fn sysinfo_probe_reports_sane_ranges() {
        let mut probe = SysinfoProbe::new(std::env::temp_dir(), Duration::from_millis(20));
        let s = probe.sample().await;
        assert!((0.0..=100.0).contains(&s.memory_percent));
        assert!((0.0..=100.0).contains(&s.disk_percent));
    }
}
