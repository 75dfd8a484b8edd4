//! Environment-driven configuration.
//!
//! Every knob has a default; `RECAST_*` variables override them. Structural
//! checks run once at load (stage weights must sum to 100, every pool needs
//! capacity) so a bad configuration fails before any work starts.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::monitor::{AlertThresholds, LoadThresholds, MonitorConfig};
use crate::orchestrator::{AdmissionConfig, RetryConfig};

/// One configured stage: name, progress weight, and concurrency limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSettings {
    pub name: String,
    pub weight: u32,
    pub concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub ffmpeg_binary: String,
    pub ffprobe_binary: String,
    pub stages: Vec<StageSettings>,
    pub retry: RetryConfig,
    pub monitor: MonitorConfig,
    pub admission: AdmissionConfig,
    pub heartbeat_ms: u64,
    pub cleanup_on_exit: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("./input"),
            output_dir: PathBuf::from("./output"),
            ffmpeg_binary: "ffmpeg".to_string(),
            ffprobe_binary: "ffprobe".to_string(),
            stages: vec![
                StageSettings {
                    name: "transcode".to_string(),
                    weight: 70,
                    concurrency: 2,
                },
                StageSettings {
                    name: "thumbnail".to_string(),
                    weight: 30,
                    concurrency: 4,
                },
            ],
            retry: RetryConfig::default(),
            monitor: MonitorConfig::default(),
            admission: AdmissionConfig::default(),
            heartbeat_ms: 1000,
            cleanup_on_exit: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            input_dir: env_path("RECAST_INPUT_DIR", defaults.input_dir),
            output_dir: env_path("RECAST_OUTPUT_DIR", defaults.output_dir),
            ffmpeg_binary: env_string("RECAST_FFMPEG", defaults.ffmpeg_binary),
            ffprobe_binary: env_string("RECAST_FFPROBE", defaults.ffprobe_binary),
            stages: defaults
                .stages
                .into_iter()
                .map(|mut stage| {
                    let key = format!("RECAST_{}_CONCURRENCY", stage.name.to_uppercase());
                    stage.concurrency = env_parse(&key, stage.concurrency);
                    stage
                })
                .collect(),
            retry: RetryConfig {
                max_attempts: env_parse("RECAST_MAX_ATTEMPTS", defaults.retry.max_attempts),
                delay_ms: env_parse("RECAST_RETRY_DELAY_MS", defaults.retry.delay_ms),
                task_timeout_secs: env_parse(
                    "RECAST_TASK_TIMEOUT_SECS",
                    defaults.retry.task_timeout_secs,
                ),
            },
            monitor: MonitorConfig {
                poll_interval_ms: env_parse(
                    "RECAST_POLL_INTERVAL_MS",
                    defaults.monitor.poll_interval_ms,
                ),
                cpu_sample_window_ms: env_parse(
                    "RECAST_CPU_SAMPLE_WINDOW_MS",
                    defaults.monitor.cpu_sample_window_ms,
                ),
                cpu_window_size: env_parse("RECAST_CPU_WINDOW", defaults.monitor.cpu_window_size),
                load: LoadThresholds {
                    cpu: env_parse("RECAST_CPU_LOAD_THRESHOLD", defaults.monitor.load.cpu),
                    memory: env_parse("RECAST_MEMORY_LOAD_THRESHOLD", defaults.monitor.load.memory),
                    disk: env_parse("RECAST_DISK_LOAD_THRESHOLD", defaults.monitor.load.disk),
                },
                alert: AlertThresholds {
                    cpu: env_parse("RECAST_CPU_ALERT_THRESHOLD", defaults.monitor.alert.cpu),
                    memory: env_parse(
                        "RECAST_MEMORY_ALERT_THRESHOLD",
                        defaults.monitor.alert.memory,
                    ),
                    disk: env_parse("RECAST_DISK_ALERT_THRESHOLD", defaults.monitor.alert.disk),
                    disk_critical: env_parse(
                        "RECAST_DISK_CRITICAL_THRESHOLD",
                        defaults.monitor.alert.disk_critical,
                    ),
                },
            },
            admission: AdmissionConfig {
                cooldown_secs: env_parse("RECAST_COOLDOWN_SECS", defaults.admission.cooldown_secs),
                max_wait_cycles: env_parse(
                    "RECAST_MAX_WAIT_CYCLES",
                    defaults.admission.max_wait_cycles,
                ),
                recheck_interval_secs: env_parse(
                    "RECAST_RECHECK_INTERVAL_SECS",
                    defaults.admission.recheck_interval_secs,
                ),
            },
            heartbeat_ms: env_parse("RECAST_HEARTBEAT_MS", defaults.heartbeat_ms),
            cleanup_on_exit: env_parse("RECAST_CLEANUP_ON_EXIT", defaults.cleanup_on_exit),
        };
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that must hold before any work starts.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(Error::config("at least one stage must be configured"));
        }
        let total: u32 = self.stages.iter().map(|s| s.weight).sum();
        if total != 100 {
            return Err(Error::config(format!(
                "stage weights must sum to 100 (got {total})"
            )));
        }
        if let Some(stage) = self.stages.iter().find(|s| s.concurrency == 0) {
            return Err(Error::config(format!(
                "stage '{}' needs a concurrency of at least 1",
                stage.name
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::config("max attempts must be at least 1"));
        }
        Ok(())
    }
}

fn env_string(key: &str, default: String) -> String {
    env::var(key).unwrap_or(default)
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn weights_must_sum_to_100() {
        let mut config = AppConfig::default();
        config.stages[0].weight = 50;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sum to 100"));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = AppConfig::default();
        config.stages[1].concurrency = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("thumbnail"));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let mut config = AppConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        // Unique key so parallel tests cannot interfere.
        unsafe { env::set_var("RECAST_TEST_ENV_PARSE_GARBAGE", "not-a-number") };
        assert_eq!(env_parse("RECAST_TEST_ENV_PARSE_GARBAGE", 7u64), 7);
        unsafe { env::remove_var("RECAST_TEST_ENV_PARSE_GARBAGE") };
    }

    #[test]
    fn env_parse_reads_valid_values() {
        unsafe { env::set_var("RECAST_TEST_ENV_PARSE_VALID", "42") };
        assert_eq!(env_parse("RECAST_TEST_ENV_PARSE_VALID", 7u64), 42);
        unsafe { env::remove_var("RECAST_TEST_ENV_PARSE_VALID") };
    }
}
