//! Worker Pool
//!
//! Resolves the worker for each step of a run. Steps can be bound to a
//! configured worker by name; unbound container steps are looked up by
//! their image, unbound function steps run on the in-process worker.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::error::{FlowError, Result};
use crate::workflow::WorkflowStep;

use super::base::Worker;
use super::factory::WorkerFactory;
use super::function::FunctionWorker;

/// Per-run worker lookup.
#[derive(Debug)]
pub struct WorkerPool {
    factory: WorkerFactory,
    managers: HashMap<String, String>,
    function_worker: Arc<dyn Worker>,
}

impl WorkerPool {
    /// Creates a pool from a factory and step-to-worker bindings.
    ///
    /// Fails with `UnknownObject` if a binding names a worker that has no
    /// specification.
    pub fn new(factory: WorkerFactory, managers: HashMap<String, String>) -> Result<Self> {
        for (step, worker) in &managers {
            if !factory.contains(worker) {
                return Err(FlowError::UnknownObject {
                    type_name: "worker",
                    identifier: format!("{} (bound to step '{}')", worker, step),
                });
            }
        }
        Ok(Self {
            factory,
            managers,
            function_worker: Arc::new(FunctionWorker::default()),
        })
    }

    /// Returns the worker that executes `step`.
    pub fn get(&mut self, step: &WorkflowStep) -> Result<Arc<dyn Worker>> {
        if let Some(identifier) = self.managers.get(step.name()) {
            debug!("Step '{}' bound to worker '{}'", step.name(), identifier);
            return self.factory.get(identifier);
        }
        match step {
            WorkflowStep::Container(container) => self.factory.get(&container.image),
            WorkflowStep::Function(_) => Ok(Arc::clone(&self.function_worker)),
        }
    }
}
