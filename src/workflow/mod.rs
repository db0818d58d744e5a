//! Workflow Definition Module
//!
//! Provides data structures for serial workflows, their runs, and the
//! results produced while executing them.
//!
//! # Structure
//!
//! - [`model`]: Steps and the execution context
//! - [`result`]: Per-step and per-run execution results
//! - [`state`]: Run lifecycle states
//! - [`run`]: Run handles and serialized run descriptors
//! - [`template`]: Resolved workflow templates and run arguments
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Structural validation

pub mod model;
pub mod parser;
pub mod result;
pub mod run;
pub mod state;
pub mod template;
pub mod validator;

pub use model::{
    Context, ContainerStep, FunctionArgs, FunctionStep, OutputCapture, StepFunction, WorkflowStep,
};
pub use parser::{load_workflow, parse_workflow, FunctionRegistry};
pub use result::{ExecResult, RunResult, StepException};
pub use run::{FileDescriptor, RunDescriptor, RunHandle};
pub use state::{deserialize_state, serialize_state, WorkflowState};
pub use template::{InputFile, RunArgument, RunArguments, WorkflowTemplate};
pub use validator::validate_workflow;
