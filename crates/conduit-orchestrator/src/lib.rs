//! Multi-stage workflow orchestration over agent capabilities.
//!
//! A workflow takes one natural-language query through understanding, data
//! retrieval and visualization, each served by a configured agent. Results
//! are cached per workflow and per stage, and every stage transition is
//! published to progress subscribers.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Runs workflows against an [`conduit_transport::AgentInvoker`].
//! - [`PipelineConfig`] — Stage-to-agent bindings and workflow limits.
//! - [`WorkflowOutcome`] — Final status with all completed stage results.
//! - [`ProgressReporter`] — Broadcast of [`ProgressEvent`]s to observers.

/// Workflow execution.
pub mod engine;
/// Progress fan-out.
pub mod progress;
/// Stages, events and outcomes.
pub mod types;

pub use engine::Orchestrator;
pub use progress::ProgressReporter;
pub use types::{
    PipelineConfig, ProgressEvent, StageBinding, StageFailure, StageResult, StageStatus,
    WorkflowOutcome, WorkflowStage, WorkflowState,
};
