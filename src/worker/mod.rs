//! Workers Module
//!
//! Workers execute individual workflow steps:
//!
//! - [`FunctionWorker`]: calls step functions in-process
//! - [`SubprocessWorker`]: runs step commands as local shell processes
//! - [`DockerWorker`]: runs step commands inside containers
//!
//! Workers are configured through [`WorkerSpec`] documents, built by the
//! [`WorkerFactory`] and resolved per step by the [`WorkerPool`].

pub mod base;
pub mod docker;
pub mod factory;
pub mod function;
pub mod manager;
pub mod subprocess;

pub use base::{
    expand_command, merge_env, placeholders, CancelToken, ContainerWorker, ExpandedStep, Worker,
};
pub use docker::{BindMount, BollardClient, ContainerClient, ContainerOutput, ContainerRequest, DockerWorker};
pub use factory::{
    ArgValue, KeyValue, WorkerArgs, WorkerConstructor, WorkerFactory, WorkerRef, WorkerRegistry,
    WorkerSpec,
};
pub use function::FunctionWorker;
pub use manager::WorkerPool;
pub use subprocess::SubprocessWorker;
