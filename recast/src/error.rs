//! Application-wide error types.

use thiserror::Error;

use crate::engine::EngineError;
use crate::monitor::Resource;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transcode failed for '{item}' in stage '{stage}' after {attempts} attempt(s): {source}")]
    Transcode {
        stage: String,
        item: String,
        attempts: u32,
        #[source]
        source: EngineError,
    },

    #[error("Resource exhaustion: {resource} at {value:.1}% (critical threshold {threshold:.1}%)")]
    ResourceExhaustion {
        resource: Resource,
        value: f32,
        threshold: f32,
    },

    #[error("Validation worker crashed: {0}")]
    WorkerCrash(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
