//! Core orchestration logic.
//!
//! This module contains:
//! - Lifetime: cancellation scopes for shutdown and task timeouts
//! - Pipeline: per-message task execution and pipeline launchers
//! - Orchestrator: wires triggers to pipelines

pub mod lifetime;
pub mod orchestrator;
pub mod pipeline;

// Re-export commonly used types
pub use lifetime::Lifetime;
pub use orchestrator::Orchestrator;
pub use pipeline::{
    launcher_for, run_pipeline, BoundedLauncher, PipelineFuture, PipelineLauncher, PipelineReport,
    TaskReport, TaskStatus, UnboundedLauncher,
};
