//! Concurrent batch transcode orchestration.
//!
//! A fixed sequence of stages runs over a scanned and validated set of media
//! items. Each stage owns a bounded worker pool driving an external
//! transcoding engine; a resource monitor applies backpressure through an
//! admission gate; every in-flight process handle lives in a registry so a
//! critical breach can terminate everything at once.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod media;
pub mod monitor;
pub mod orchestrator;

pub use error::{Error, Result};
