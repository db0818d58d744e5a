//! Worker Interface
//!
//! A worker executes a single workflow step on a storage volume and reports
//! the outcome as an [`ExecResult`]. Step failures are returned as data
//! (non-zero return code, stderr, exception); `Err` is reserved for steps a
//! worker cannot execute at all.
//!
//! Container workers share command template expansion:
//! - `$$` is a literal dollar sign
//! - `${name}` and `$name` are placeholders
//! - values come from the placeholder name itself, then the run context,
//!   then the worker's fixed variables (later sources win)

use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::path::Path;
use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;

use crate::error::{FlowError, Result};
use crate::volume::StorageVolume;
use crate::workflow::{ContainerStep, Context, ExecResult, WorkflowStep};

/// Placeholder syntax in command templates.
static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$(?:(\$)|\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .expect("placeholder pattern is valid")
});

/// Cancellation signal shared between a run and its owner.
///
/// The flag is checked before every step. In addition the token holds the
/// process of the step that is currently running, which `cancel` kills.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    canceled: Arc<AtomicBool>,
    process: Arc<Mutex<Option<Child>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals cancellation and kills the tracked process, if any.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        if let Some(child) = self.lock_process().as_mut() {
            kill(child);
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Tracks `child` until it exits. A token that is already canceled
    /// kills the process immediately.
    pub fn attach(&self, mut child: Child) {
        let mut slot = self.lock_process();
        if self.is_canceled() {
            kill(&mut child);
        }
        *slot = Some(child);
    }

    /// Polls the tracked process and releases it once it has exited.
    pub fn try_wait(&self) -> io::Result<Option<ExitStatus>> {
        let mut slot = self.lock_process();
        let child = slot
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no process attached"))?;
        match child.try_wait() {
            Ok(None) => Ok(None),
            outcome => {
                *slot = None;
                outcome
            }
        }
    }

    fn lock_process(&self) -> MutexGuard<'_, Option<Child>> {
        self.process.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn kill(child: &mut Child) {
    match child.kill() {
        Ok(()) => info!("Killed process {}", child.id()),
        Err(e) => warn!("Failed to kill process {}: {}", child.id(), e),
    }
}

/// Executes workflow steps.
pub trait Worker: Send + Sync + Debug {
    /// Unique worker identifier.
    fn identifier(&self) -> &str;

    /// Storage volume the worker operates on, None for the default store.
    fn volume(&self) -> Option<&str> {
        None
    }

    /// Executes `step` using files on `store`.
    ///
    /// # Arguments
    ///
    /// * `step` - The step to execute
    /// * `context` - Run variables; function steps may add their result
    /// * `store` - Volume holding the step's input files
    ///
    /// # Returns
    ///
    /// * `Ok(ExecResult)` - The step ran (successfully or not)
    /// * `Err` - The worker cannot execute this kind of step
    fn exec(
        &self,
        step: &WorkflowStep,
        context: &mut Context,
        store: &dyn StorageVolume,
    ) -> Result<ExecResult>;

    /// Executes `step`, stopping early once `cancel` fires.
    ///
    /// Workers that cannot interrupt a running step use [`Worker::exec`].
    fn exec_cancellable(
        &self,
        step: &WorkflowStep,
        context: &mut Context,
        store: &dyn StorageVolume,
        _cancel: &CancelToken,
    ) -> Result<ExecResult> {
        self.exec(step, context, store)
    }
}

/// A container step with expanded commands and merged environment.
#[derive(Debug, Clone)]
pub struct ExpandedStep<'a> {
    pub step: ContainerStep,
    pub env: HashMap<String, String>,
    pub rundir: &'a Path,
}

/// Worker that runs the commands of container steps.
///
/// Implementors supply `run()`; [`ContainerWorker::exec_container`] expands
/// the command templates and merges environment variables first.
pub trait ContainerWorker: Worker {
    /// Fixed template variables that run arguments cannot override.
    fn variables(&self) -> &HashMap<String, String>;

    /// Worker-level environment variables.
    fn env(&self) -> &HashMap<String, String>;

    /// Runs the expanded commands of `step` in `rundir`.
    fn run(&self, step: &ContainerStep, env: &HashMap<String, String>, rundir: &Path) -> ExecResult;

    /// Expands `step` against `context` and delegates to `run()`.
    fn exec_container(
        &self,
        step: &WorkflowStep,
        context: &Context,
        store: &dyn StorageVolume,
    ) -> Result<ExecResult> {
        let expanded = self.expand_step(step, context, store)?;
        Ok(self.run(&expanded.step, &expanded.env, expanded.rundir))
    }

    /// Expands the command templates of `step` for execution on `store`.
    fn expand_step<'a>(
        &self,
        step: &WorkflowStep,
        context: &Context,
        store: &'a dyn StorageVolume,
    ) -> Result<ExpandedStep<'a>> {
        let WorkflowStep::Container(container) = step else {
            return Err(FlowError::UnsupportedStep {
                worker: self.identifier().to_string(),
                step: step.name().to_string(),
            });
        };
        let rundir = store.local_path().ok_or_else(|| {
            FlowError::InvalidConfig(format!(
                "worker '{}' needs a local directory but volume '{}' is {}",
                self.identifier(),
                store.identifier(),
                store.describe()
            ))
        })?;

        let mut expanded = container.clone();
        expanded.commands = container
            .commands
            .iter()
            .map(|cmd| expand_command(cmd, context, self.variables()))
            .collect();
        let env = merge_env(self.env(), &container.env);

        debug!(
            "Worker '{}' running step '{}' in {}",
            self.identifier(),
            container.name,
            rundir.display()
        );
        Ok(ExpandedStep {
            step: expanded,
            env,
            rundir,
        })
    }
}

/// Names of all placeholders in `template`, in order of appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in PLACEHOLDER.captures_iter(template) {
        if let Some(name) = caps.get(2).or_else(|| caps.get(3)) {
            if !names.iter().any(|n| n == name.as_str()) {
                names.push(name.as_str().to_string());
            }
        }
    }
    names
}

/// Renders a context value for use in a command line.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Expands the placeholders in a command template.
///
/// Unknown placeholders expand to their own name. Fixed `variables` take
/// precedence over values from `context`.
pub fn expand_command(
    template: &str,
    context: &Context,
    variables: &HashMap<String, String>,
) -> String {
    let mut args: HashMap<String, String> = placeholders(template)
        .into_iter()
        .map(|name| (name.clone(), name))
        .collect();
    for (key, value) in context {
        args.insert(key.clone(), render(value));
    }
    for (key, value) in variables {
        args.insert(key.clone(), value.clone());
    }

    let expanded = PLACEHOLDER.replace_all(template, |caps: &Captures| {
        if caps.get(1).is_some() {
            return "$".to_string();
        }
        let name = caps
            .get(2)
            .or_else(|| caps.get(3))
            .map(|m| m.as_str())
            .unwrap_or_default();
        args.get(name).cloned().unwrap_or_else(|| name.to_string())
    });
    expanded.trim().to_string()
}

/// Merges worker and step environment variables; step values win.
pub fn merge_env(
    worker: &HashMap<String, String>,
    step: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env = worker.clone();
    env.extend(step.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders("${python} $run $me"), vec!["python", "run", "me"]);
        assert_eq!(placeholders("echo $$HOME ${x}y $x"), vec!["x"]);
        assert!(placeholders("no placeholders").is_empty());
    }

    #[test]
    fn test_fixed_variables_win_over_context() {
        let context: Context = [
            ("run".to_string(), json!("my_model.py")),
            ("me".to_string(), json!(1)),
        ]
        .into_iter()
        .collect();
        let fixed = vars(&[("run", "static.py")]);

        let cmd = expand_command("${python} $run $me", &context, &fixed);
        assert_eq!(cmd, "python static.py 1");
    }

    #[test]
    fn test_expand_escapes_and_whitespace() {
        let context: Context = [("name".to_string(), json!("World"))].into_iter().collect();
        let cmd = expand_command("  echo $$PATH ${name}s  ", &context, &HashMap::new());
        assert_eq!(cmd, "echo $PATH Worlds");
    }

    #[test]
    fn test_cancel_token_kills_attached_process() {
        let token = CancelToken::new();
        let child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        token.attach(child);
        assert!(token.try_wait().unwrap().is_none());

        let handle = token.clone();
        handle.cancel();
        assert!(token.is_canceled());

        let started = std::time::Instant::now();
        let status = loop {
            if let Some(status) = token.try_wait().unwrap() {
                break status;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        };
        assert!(!status.success());
        assert!(started.elapsed() < std::time::Duration::from_secs(4));
        assert!(token.try_wait().is_err());
    }

    #[test]
    fn test_attach_after_cancel_kills_process() {
        let token = CancelToken::new();
        token.cancel();
        token.attach(std::process::Command::new("sleep").arg("5").spawn().unwrap());
        let status = loop {
            if let Some(status) = token.try_wait().unwrap() {
                break status;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        };
        assert!(!status.success());
    }

    #[test]
    fn test_merge_env_step_wins() {
        let worker = vars(&[("A", "1"), ("B", "2")]);
        let step = vars(&[("B", "3"), ("C", "4")]);
        let env = merge_env(&worker, &step);
        assert_eq!(env, vars(&[("A", "1"), ("B", "3"), ("C", "4")]));
    }
}
