//! Execution boundary to the external render pipeline.
//!
//! A render job runs as two sequential subprocesses -- scene preparation,
//! then the batch render -- with a fixed CLI contract. This crate owns
//! spawning them, draining their output into the log, relaying phase
//! transitions and failures back to the scheduler, and force-killing the
//! active child when a job is cancelled.

pub mod command;
pub mod monitor;
pub mod pipeline;

pub use pipeline::{
    PipelineEvent, PipelineHandle, PipelineLauncher, PipelineSpec, ProcessLauncher, RenderPhase,
};
