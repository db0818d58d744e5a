//! Execution Results
//!
//! Per-step execution outcomes and the accumulated result of a run.

use std::fmt;

use serde_json::Value;

use crate::error::{FlowError, Result};

use super::model::{Context, WorkflowStep};

/// Captured failure of a step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepException {
    pub message: String,
}

impl StepException {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for StepException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StepException {}

/// Outcome of executing a single workflow step.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub step: WorkflowStep,

    /// Zero on success
    pub returncode: i32,

    pub stdout: Vec<String>,

    pub stderr: Vec<String>,

    /// Error that caused the step to fail, if any
    pub exception: Option<StepException>,
}

impl ExecResult {
    /// Creates a successful result without output.
    pub fn new(step: WorkflowStep) -> Self {
        Self {
            step,
            returncode: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
            exception: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.returncode == 0
    }

    /// Records an error as the cause of a failed step.
    ///
    /// Sets the return code to 1 and appends the error chain to stderr.
    pub fn fail(&mut self, message: impl Into<String>, trace: Vec<String>) {
        let message = message.into();
        self.returncode = 1;
        self.stderr.extend(trace);
        self.exception = Some(StepException::new(message));
    }
}

/// Accumulated results of a serial workflow run.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub context: Context,
    pub steps: Vec<ExecResult>,
}

impl RunResult {
    /// Creates a result whose context starts with the run arguments.
    pub fn new(arguments: Context) -> Self {
        Self {
            context: arguments,
            steps: Vec::new(),
        }
    }

    pub fn add(&mut self, result: ExecResult) {
        self.steps.push(result);
    }

    /// Exception of the last executed step.
    pub fn exception(&self) -> Option<&StepException> {
        self.steps.last().and_then(|r| r.exception.as_ref())
    }

    /// Return code of the last executed step, None if nothing ran.
    pub fn returncode(&self) -> Option<i32> {
        self.steps.last().map(|r| r.returncode)
    }

    /// Value of a context variable.
    pub fn get(&self, var: &str) -> Result<&Value> {
        self.context
            .get(var)
            .ok_or_else(|| FlowError::unknown("variable", var))
    }

    /// Standard output of all steps, in step order.
    pub fn stdout(&self) -> Vec<String> {
        self.steps.iter().flat_map(|r| r.stdout.iter().cloned()).collect()
    }

    /// Standard error of all steps, in step order.
    pub fn stderr(&self) -> Vec<String> {
        self.steps.iter().flat_map(|r| r.stderr.iter().cloned()).collect()
    }

    /// Combined standard output and standard error.
    pub fn log(&self) -> Vec<String> {
        let mut log = self.stdout();
        log.extend(self.stderr());
        log
    }

    /// Fails with the last step's exception if the run did not succeed.
    pub fn raise_for_status(&self) -> std::result::Result<(), StepException> {
        match self.returncode() {
            Some(code) if code != 0 => Err(self.exception().cloned().unwrap_or_else(|| {
                StepException::new(format!("step exited with code {}", code))
            })),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::ContainerStep;
    use serde_json::json;

    fn step(name: &str) -> WorkflowStep {
        ContainerStep::new(name, "test").into()
    }

    #[test]
    fn test_empty_run_result() {
        let result = RunResult::new(Context::from([("x".to_string(), json!(1))]));
        assert_eq!(result.returncode(), None);
        assert!(result.exception().is_none());
        assert_eq!(result.get("x").unwrap(), &json!(1));
        assert!(result.get("y").is_err());
        assert!(result.raise_for_status().is_ok());
    }

    #[test]
    fn test_run_result_aggregates_steps() {
        let mut result = RunResult::default();

        let mut r1 = ExecResult::new(step("s1"));
        r1.stdout.push("a".into());
        r1.stderr.push("e1".into());
        result.add(r1);

        let mut r2 = ExecResult::new(step("s2"));
        r2.stdout.push("b".into());
        r2.fail("boom", vec!["boom".into()]);
        result.add(r2);

        assert_eq!(result.returncode(), Some(1));
        assert_eq!(result.exception().unwrap().message, "boom");
        assert_eq!(result.stdout(), vec!["a", "b"]);
        assert_eq!(result.stderr(), vec!["e1", "boom"]);
        assert_eq!(result.log(), vec!["a", "b", "e1", "boom"]);
        assert!(result.raise_for_status().is_err());
    }
}
