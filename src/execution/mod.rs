//! Workflow Execution Module
//!
//! Runs serial workflows and manages the lifecycle of their runs.
//!
//! # Architecture
//!
//! - [`runner`]: Executes a step sequence with file staging between volumes
//! - [`config`]: Engine configuration documents and environment settings
//! - [`engine`]: Run lifecycle, synchronous and asynchronous execution

pub mod config;
pub mod engine;
pub mod runner;

pub use config::{EngineConfig, StepBinding};
pub use engine::{ChannelCallback, RunCallback, RunReport, SerialWorkflowEngine};
pub use runner::{exec_workflow, exec_workflow_cancellable, CancelToken};
