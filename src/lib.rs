//! FlowRunner - Serial Workflow Execution Engine
//!
//! Executes serial workflows made of function steps and container steps.
//! Each step runs on a worker bound to a storage volume; the files a step
//! needs are replicated between volumes on demand.
//!
//! # Architecture
//!
//! - [`workflow`]: Steps, run results, run states and workflow documents
//! - [`volume`]: Storage volumes and file availability tracking
//! - [`worker`]: Function, subprocess and Docker workers and their configuration
//! - [`execution`]: The serial runner and the run lifecycle engine
//! - [`environment`]: Interpreter paths exposed to command templates
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowrunner::execution::{EngineConfig, SerialWorkflowEngine};
//! use flowrunner::volume::{BucketVolume, FileSystemStorage};
//! use flowrunner::workflow::{FunctionRegistry, RunArguments, RunHandle};
//! use flowrunner::load_workflow;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a workflow from YAML
//!     let template = load_workflow("pipeline.yaml", &FunctionRegistry::new())?;
//!
//!     // Create a synchronous engine on a local base directory
//!     let fs = Arc::new(FileSystemStorage::new("/data/analysis", None)?);
//!     let engine = SerialWorkflowEngine::new(fs, EngineConfig::default(), false, None);
//!
//!     // Execute the workflow
//!     let staticfs = BucketVolume::open("pipeline", "", None);
//!     let (state, _) = engine.exec_workflow(
//!         &RunHandle::generate(),
//!         &template,
//!         RunArguments::new(),
//!         &staticfs,
//!         None,
//!     )?;
//!     println!("{}", state);
//!     Ok(())
//! }
//! ```

pub mod environment;
pub mod error;
pub mod execution;
pub mod volume;
pub mod worker;
pub mod workflow;

// Re-export commonly used types
pub use error::{FlowError, Result};
pub use execution::{EngineConfig, SerialWorkflowEngine};
pub use volume::{StorageVolume, VolumeManager};
pub use worker::{Worker, WorkerPool};
pub use workflow::parser::load_workflow;
pub use workflow::{ContainerStep, FunctionStep, WorkflowState, WorkflowStep};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FlowRunner";
