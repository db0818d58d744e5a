//! Subprocess Worker
//!
//! Runs the commands of a container step as shell commands on the local
//! machine, inside the run directory of the step's volume.

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Command, ExitStatus, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};

use crate::environment::default_variables;
use crate::error::{stacktrace, Result};
use crate::volume::StorageVolume;
use crate::workflow::{ContainerStep, Context, ExecResult, WorkflowStep};

use super::base::{CancelToken, ContainerWorker, Worker};
use super::factory::WorkerArgs;

/// Shell used to interpret command lines.
const SHELL: &str = "sh";

/// Interval between checks of a running command.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Worker that executes step commands as local processes.
#[derive(Debug, Clone, Default)]
pub struct SubprocessWorker {
    identifier: String,
    variables: HashMap<String, String>,
    env: HashMap<String, String>,
    volume: Option<String>,
}

impl SubprocessWorker {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Default::default()
        }
    }

    /// Worker seeded with the `python` and `java` interpreter paths.
    pub fn with_default_variables(identifier: impl Into<String>) -> Self {
        Self::new(identifier).with_variables(default_variables())
    }

    pub fn from_args(args: WorkerArgs) -> Self {
        Self {
            identifier: args.identifier,
            variables: args.variables,
            env: args.env,
            volume: args.volume,
        }
    }

    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables.extend(variables);
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_volume(mut self, volume: impl Into<String>) -> Self {
        self.volume = Some(volume.into());
        self
    }
}

/// Exit code of a finished process; termination by signal `n` maps to `-n`.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    1
}

/// Appends the text of a captured stream as a single entry, if not empty.
fn push_output(lines: &mut Vec<String>, bytes: &[u8]) {
    let text = String::from_utf8_lossy(bytes);
    if !text.is_empty() {
        lines.push(text.to_string());
    }
}

/// Reads a child's output stream to the end on a separate thread.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            if let Err(e) = pipe.read_to_end(&mut buf) {
                warn!("Failed to read command output: {}", e);
            }
        }
        buf
    })
}

/// Runs `cmd` in `rundir` and waits for it, unless `cancel` fires first.
///
/// The output of a canceled command is discarded, since processes started
/// by the shell may keep its pipes open.
fn run_command(
    cmd: &str,
    env: &HashMap<String, String>,
    rundir: &Path,
    cancel: &CancelToken,
) -> io::Result<Output> {
    let mut child = Command::new(SHELL)
        .arg("-c")
        .arg(cmd)
        .current_dir(rundir)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    cancel.attach(child);

    let status = loop {
        if let Some(status) = cancel.try_wait()? {
            break status;
        }
        thread::sleep(POLL_INTERVAL);
    };
    if cancel.is_canceled() {
        return Ok(Output {
            status,
            stdout: Vec::new(),
            stderr: b"canceled".to_vec(),
        });
    }
    Ok(Output {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    })
}

impl SubprocessWorker {
    /// Runs the commands of `step` in order until one fails.
    fn run_commands(
        &self,
        step: &ContainerStep,
        env: &HashMap<String, String>,
        rundir: &Path,
        cancel: &CancelToken,
    ) -> ExecResult {
        let mut result = ExecResult::new(step.clone().into());
        for cmd in &step.commands {
            debug!("Executing: {}", cmd);
            match run_command(cmd, env, rundir, cancel) {
                Ok(output) => {
                    push_output(&mut result.stdout, &output.stdout);
                    push_output(&mut result.stderr, &output.stderr);
                    if !output.status.success() {
                        result.returncode = exit_code(output.status);
                        error!(
                            "Step '{}' failed with exit code {}: {}",
                            step.name, result.returncode, cmd
                        );
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to run '{}' for step '{}': {}", cmd, step.name, e);
                    result.fail(e.to_string(), stacktrace(&e));
                    break;
                }
            }
        }
        result
    }
}

impl Worker for SubprocessWorker {
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
        self.exec_cancellable(step, context, store, &CancelToken::new())
    }

    fn exec_cancellable(
        &self,
        step: &WorkflowStep,
        context: &mut Context,
        store: &dyn StorageVolume,
        cancel: &CancelToken,
    ) -> Result<ExecResult> {
        let expanded = self.expand_step(step, context, store)?;
        Ok(self.run_commands(&expanded.step, &expanded.env, expanded.rundir, cancel))
    }
}

impl ContainerWorker for SubprocessWorker {
    fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    fn run(&self, step: &ContainerStep, env: &HashMap<String, String>, rundir: &Path) -> ExecResult {
        self.run_commands(step, env, rundir, &CancelToken::new())
    }
}
