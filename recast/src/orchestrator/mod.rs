//! The concurrent transcode orchestration core.
//!
//! A [`PipelineController`] drives the fixed stage sequence; each stage runs
//! through a [`StageExecutor`] with a bounded worker pool; every task settles
//! through the [`RetryExecutor`]; the [`AdmissionGate`] applies load-based
//! backpressure and the [`ActiveTaskRegistry`] carries the handles needed for
//! mass cancellation.

pub mod admission;
pub mod controller;
pub mod executor;
pub mod registry;
pub mod retry;
pub mod task;

pub use admission::{Admission, AdmissionConfig, AdmissionGate};
pub use controller::{
    PipelineConfig, PipelineController, PipelineOutcome, RunState, RunStateHandle,
};
pub use executor::{
    CommandPlanner, FailedTask, StageExecutor, StageOutcome, StageProgress, StageSpec,
};
pub use registry::ActiveTaskRegistry;
pub use retry::{RetryConfig, RetryExecutor};
pub use task::{Task, TaskOutcome, TaskStatus};
