//! Retry executor: bounded fixed-delay retries around engine invocations.
//!
//! No backoff, no jitter. Every attempt is a fresh invocation; success
//! short-circuits; cancellation preempts both running attempts and the delay
//! between them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::task::TaskOutcome;
use crate::engine::{CommandSpec, EngineError, TranscodeEngine};
use crate::events::ProgressReporter;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum invocation attempts per task.
    pub max_attempts: u32,
    /// Fixed delay between attempts, in milliseconds.
    pub delay_ms: u64,
    /// Watchdog deadline per attempt, in seconds. 0 disables the watchdog.
    pub task_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 3000,
            task_timeout_secs: 3600,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn watchdog(&self) -> Option<Duration> {
        (self.task_timeout_secs > 0).then(|| Duration::from_secs(self.task_timeout_secs))
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    pub fn with_task_timeout_secs(mut self, secs: u64) -> Self {
        self.task_timeout_secs = secs;
        self
    }
}

/// Drives one task's engine invocations to a settled outcome.
pub struct RetryExecutor {
    engine: Arc<dyn TranscodeEngine>,
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(engine: Arc<dyn TranscodeEngine>, config: RetryConfig) -> Self {
        Self { engine, config }
    }

    /// Run one task until it settles. The attempt counter never exceeds
    /// `max_attempts`; a cancelled attempt or delay settles as `Aborted`
    /// without consuming further attempts.
    pub async fn run_with_retry(
        &self,
        spec: &CommandSpec,
        progress: ProgressReporter,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        let mut attempts = 0u32;
        loop {
            if cancel.is_cancelled() {
                return TaskOutcome::Aborted;
            }
            attempts += 1;
            match self.attempt(spec, progress.clone(), cancel).await {
                Ok(artifact) => {
                    debug!(input = %spec.input.display(), attempts, "task succeeded");
                    return TaskOutcome::Succeeded { artifact, attempts };
                }
                Err(EngineError::Cancelled) => return TaskOutcome::Aborted,
                Err(error) => {
                    warn!(
                        input = %spec.input.display(),
                        attempt = attempts,
                        max = self.config.max_attempts,
                        %error,
                        "attempt failed"
                    );
                    if attempts >= self.config.max_attempts {
                        return TaskOutcome::Failed { error, attempts };
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return TaskOutcome::Aborted,
                        _ = tokio::time::sleep(self.config.delay()) => {}
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        spec: &CommandSpec,
        progress: ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, EngineError> {
        let invocation = self.engine.invoke(spec, progress, cancel.child_token());
        match self.config.watchdog() {
            Some(deadline) => match tokio::time::timeout(deadline, invocation).await {
                Ok(result) => result,
                // Dropping the invocation future kills its process.
                Err(_) => Err(EngineError::TimedOut(deadline)),
            },
            None => invocation.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;

    struct ScriptedEngine {
        failures_before_success: u32,
        invocations: AtomicU32,
        run_time: Duration,
    }

    impl ScriptedEngine {
        fn failing(failures_before_success: u32) -> Self {
            Self {
                failures_before_success,
                invocations: AtomicU32::new(0),
                run_time: Duration::ZERO,
            }
        }

        fn slow(run_time: Duration) -> Self {
            Self {
                failures_before_success: 0,
                invocations: AtomicU32::new(0),
                run_time,
            }
        }
    }

    #[async_trait]
    impl TranscodeEngine for ScriptedEngine {
        async fn invoke(
            &self,
            spec: &CommandSpec,
            _progress: ProgressReporter,
            cancel: CancellationToken,
        ) -> Result<PathBuf, EngineError> {
            let n = self.invocations.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(self.run_time) => {}
            }
            if n < self.failures_before_success {
                Err(EngineError::Failed {
                    code: Some(1),
                    detail: "scripted failure".into(),
                })
            } else {
                Ok(spec.output.clone())
            }
        }

        fn is_available(&self) -> bool {
            true
        }

        fn version(&self) -> Option<String> {
            Some("scripted".into())
        }
    }

    fn spec() -> CommandSpec {
        CommandSpec {
            input: PathBuf::from("/in/a.mp4"),
            output: PathBuf::from("/out/a.mp4"),
            args: Vec::new(),
            duration_hint: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_attempt_k() {
        let engine = Arc::new(ScriptedEngine::failing(2));
        let executor = RetryExecutor::new(engine.clone(), RetryConfig::default());
        let outcome = executor
            .run_with_retry(&spec(), ProgressReporter::noop(), &CancellationToken::new())
            .await;
        match outcome {
            TaskOutcome::Succeeded { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(engine.invocations.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_settles_as_failed_with_max_attempts() {
        let engine = Arc::new(ScriptedEngine::failing(u32::MAX));
        let executor = RetryExecutor::new(engine.clone(), RetryConfig::default());
        let outcome = executor
            .run_with_retry(&spec(), ProgressReporter::noop(), &CancellationToken::new())
            .await;
        match outcome {
            TaskOutcome::Failed { attempts, .. } => assert_eq!(attempts, 5),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(engine.invocations.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_preempts_the_retry_delay() {
        let engine = Arc::new(ScriptedEngine::failing(u32::MAX));
        let executor = RetryExecutor::new(engine.clone(), RetryConfig::default());
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        // Cancel while the first inter-attempt delay is pending.
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });
        let outcome = executor
            .run_with_retry(&spec(), ProgressReporter::noop(), &cancel)
            .await;
        assert!(matches!(outcome, TaskOutcome::Aborted));
        // Only the first attempt ran; the delay never completed.
        assert_eq!(engine.invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_deadline_counts_as_a_retryable_failure() {
        let engine = Arc::new(ScriptedEngine::slow(Duration::from_secs(120)));
        let config = RetryConfig::default()
            .with_max_attempts(2)
            .with_task_timeout_secs(10)
            .with_delay_ms(100);
        let executor = RetryExecutor::new(engine.clone(), config);
        let outcome = executor
            .run_with_retry(&spec(), ProgressReporter::noop(), &CancellationToken::new())
            .await;
        match outcome {
            TaskOutcome::Failed { error, attempts } => {
                assert_eq!(attempts, 2);
                assert!(matches!(error, EngineError::TimedOut(_)));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(engine.invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn already_cancelled_settles_without_invoking() {
        let engine = Arc::new(ScriptedEngine::failing(0));
        let executor = RetryExecutor::new(engine.clone(), RetryConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = executor
            .run_with_retry(&spec(), ProgressReporter::noop(), &cancel)
            .await;
        assert!(matches!(outcome, TaskOutcome::Aborted));
        assert_eq!(engine.invocations.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn watchdog_disabled_at_zero() {
        assert!(RetryConfig::default().with_task_timeout_secs(0).watchdog().is_none());
        assert_eq!(
            RetryConfig::default().watchdog(),
            Some(Duration::from_secs(3600))
        );
    }
}
