//! Function Worker
//!
//! Executes function steps in the current process. The callable receives
//! its arguments from the run context and a capture buffer for its output;
//! while it runs, the working directory is the step's volume directory.

use std::any::Any;
use std::env;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use log::{debug, warn};

use crate::error::{stacktrace, FlowError, Result};
use crate::volume::StorageVolume;
use crate::workflow::{Context, ExecResult, OutputCapture, WorkflowStep};

use super::base::Worker;

/// Serializes working directory changes across threads.
pub(crate) static CWD_LOCK: Mutex<()> = Mutex::new(());

/// Changes the process working directory until dropped.
struct WorkingDir {
    previous: PathBuf,
    _lock: MutexGuard<'static, ()>,
}

impl WorkingDir {
    fn enter(path: &Path) -> Result<Self> {
        let lock = CWD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let previous = env::current_dir()?;
        env::set_current_dir(path)?;
        Ok(Self {
            previous,
            _lock: lock,
        })
    }
}

impl Drop for WorkingDir {
    fn drop(&mut self) {
        if let Err(e) = env::set_current_dir(&self.previous) {
            warn!(
                "Failed to restore working directory {}: {}",
                self.previous.display(),
                e
            );
        }
    }
}

/// Extracts the message of a caught panic.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "step function panicked".to_string()
    }
}

/// Worker for function steps.
#[derive(Debug, Clone)]
pub struct FunctionWorker {
    identifier: String,
    volume: Option<String>,
}

impl FunctionWorker {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            volume: None,
        }
    }

    /// Binds the worker to the storage volume `volume`.
    pub fn with_volume(mut self, volume: impl Into<String>) -> Self {
        self.volume = Some(volume.into());
        self
    }
}

impl Default for FunctionWorker {
    fn default() -> Self {
        Self::new("code")
    }
}

impl Worker for FunctionWorker {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn volume(&self) -> Option<&str> {
        self.volume.as_deref()
    }

    fn exec(
        &self,
        step: &WorkflowStep,
        context: &mut Context,
        store: &dyn StorageVolume,
    ) -> Result<ExecResult> {
        let WorkflowStep::Function(function) = step else {
            return Err(FlowError::UnsupportedStep {
                worker: self.identifier.clone(),
                step: step.name().to_string(),
            });
        };

        let mut result = ExecResult::new(step.clone());
        let args = function.arguments(context);
        let mut capture = OutputCapture::new();
        debug!("Calling function of step '{}'", function.name);

        let outcome = {
            let _cwd = match store.local_path().map(WorkingDir::enter).transpose() {
                Ok(guard) => guard,
                Err(e) => {
                    result.fail(e.to_string(), stacktrace(&e));
                    return Ok(result);
                }
            };
            panic::catch_unwind(AssertUnwindSafe(|| (function.func)(&args, &mut capture)))
        };

        let (stdout, stderr) = capture.into_parts();
        result.stdout = stdout;
        result.stderr = stderr;

        match outcome {
            Ok(Ok(value)) => {
                if let Some(var) = &function.output {
                    context.insert(var.clone(), value);
                }
            }
            Ok(Err(e)) => result.fail(e.to_string(), stacktrace(e.as_ref())),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                result.fail(message.clone(), vec![format!("panicked: {}", message)]);
            }
        }
        Ok(result)
    }
}
