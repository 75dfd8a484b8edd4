//! Transcoding engine contract and production implementations.
//!
//! The orchestration core never builds engine command lines itself; stages
//! hand the engine an opaque [`CommandSpec`] and wait for it to settle.

pub mod ffmpeg;
pub mod probe;

pub use ffmpeg::FfmpegEngine;
pub use probe::FfprobeProber;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::events::ProgressReporter;

/// Errors surfaced by one engine invocation.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("engine not available: {0}")]
    Unavailable(String),

    #[error("failed to spawn engine process: {0}")]
    Spawn(String),

    #[error("engine exited with {code:?}: {detail}")]
    Failed { code: Option<i32>, detail: String },

    #[error("attempt exceeded the watchdog deadline of {0:?}")]
    TimedOut(Duration),

    #[error("invocation cancelled")]
    Cancelled,
}

/// One described unit of engine work. Opaque to the orchestration core:
/// stage planners build it, the engine consumes it.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Output-side arguments placed between input and output path.
    pub args: Vec<String>,
    /// Source duration used to turn engine timestamps into a progress fraction.
    pub duration_hint: Option<f64>,
}

#[async_trait]
pub trait TranscodeEngine: Send + Sync {
    /// Execute one described operation to completion.
    ///
    /// Progress fractions are reported fire-and-forget. Cancellation must
    /// terminate the underlying process promptly and return
    /// [`EngineError::Cancelled`].
    async fn invoke(
        &self,
        spec: &CommandSpec,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<PathBuf, EngineError>;

    fn is_available(&self) -> bool;

    fn version(&self) -> Option<String>;
}
