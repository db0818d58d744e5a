//! Workflow Data Model
//!
//! Core data structures representing the steps of a serial workflow and the
//! execution context threaded through them.
//!
//! A step is either a container step (a list of shell command templates run
//! inside an execution environment) or a function step (an in-process
//! callable whose result is stored in the context).

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::BoxError;

/// Variables shared by all steps of a run.
pub type Context = HashMap<String, Value>;

/// Callable executed by a function step.
pub type StepFunction =
    Arc<dyn Fn(&FunctionArgs, &mut OutputCapture) -> Result<Value, BoxError> + Send + Sync>;

/// Deserializes either a single string or array of strings into Vec<String>
pub(crate) fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

/// A step that runs shell commands in an execution environment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ContainerStep {
    /// Unique step name within the workflow
    pub name: String,

    /// Execution environment identifier (container image)
    pub image: String,

    /// Command templates, run in order
    #[serde(default)]
    pub commands: Vec<String>,

    /// Step-level environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Input files or folders (folders end in `/`)
    #[serde(deserialize_with = "single_or_vec", default)]
    pub inputs: Vec<String>,

    /// Output files or folders (folders end in `/`)
    #[serde(deserialize_with = "single_or_vec", default)]
    pub outputs: Vec<String>,
}

impl ContainerStep {
    /// Creates a container step without commands.
    ///
    /// # Example
    ///
    /// ```
    /// use flowrunner::workflow::ContainerStep;
    ///
    /// let step = ContainerStep::new("count", "python:3.9")
    ///     .with_command("${python} count.py data/names.txt")
    ///     .with_input("data/names.txt")
    ///     .with_output("results/");
    /// assert_eq!(step.commands.len(), 1);
    /// ```
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            image: image.into().trim().to_string(),
            commands: Vec::new(),
            env: HashMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Appends a command template.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    /// Replaces the command templates.
    pub fn with_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands = commands.into_iter().map(Into::into).collect();
        self
    }

    /// Sets a step-level environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.inputs.push(input.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.outputs.push(output.into());
        self
    }
}

/// A step that calls a function in the current process.
#[derive(Clone)]
pub struct FunctionStep {
    /// Unique step name within the workflow
    pub name: String,

    /// The callable
    pub func: StepFunction,

    /// Formal parameter names of the callable
    pub params: Vec<String>,

    /// Context variable that receives the return value
    pub output: Option<String>,

    /// Maps formal parameter names to context variable names
    pub varnames: HashMap<String, String>,

    pub inputs: Vec<String>,

    pub outputs: Vec<String>,
}

impl FunctionStep {
    /// Creates a function step.
    ///
    /// # Arguments
    ///
    /// * `name` - Unique step name
    /// * `params` - Formal parameter names resolved against the context
    /// * `func` - The callable
    pub fn new<F>(name: impl Into<String>, params: &[&str], func: F) -> Self
    where
        F: Fn(&FunctionArgs, &mut OutputCapture) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
            params: params.iter().map(|p| p.to_string()).collect(),
            output: None,
            varnames: HashMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Stores the return value in the context under `var`.
    pub fn with_output(mut self, var: impl Into<String>) -> Self {
        self.output = Some(var.into());
        self
    }

    /// Reads the parameter `param` from the context variable `var`.
    pub fn with_varname(mut self, param: impl Into<String>, var: impl Into<String>) -> Self {
        self.varnames.insert(param.into(), var.into());
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.inputs.push(input.into());
        self
    }

    pub fn with_output_file(mut self, output: impl Into<String>) -> Self {
        self.outputs.push(output.into());
        self
    }

    /// Collects the call arguments for this step from `context`.
    ///
    /// Parameters whose (remapped) variable is missing from the context are
    /// left out.
    pub fn arguments(&self, context: &Context) -> FunctionArgs {
        let values = self
            .params
            .iter()
            .filter_map(|param| {
                let var = self.varnames.get(param).unwrap_or(param);
                context.get(var).map(|v| (param.clone(), v.clone()))
            })
            .collect();
        FunctionArgs { values }
    }
}

impl fmt::Debug for FunctionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionStep")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("output", &self.output)
            .field("varnames", &self.varnames)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

/// A single step of a serial workflow.
#[derive(Debug, Clone)]
pub enum WorkflowStep {
    Function(FunctionStep),
    Container(ContainerStep),
}

impl WorkflowStep {
    pub fn name(&self) -> &str {
        match self {
            Self::Function(step) => &step.name,
            Self::Container(step) => &step.name,
        }
    }

    pub fn inputs(&self) -> &[String] {
        match self {
            Self::Function(step) => &step.inputs,
            Self::Container(step) => &step.inputs,
        }
    }

    pub fn outputs(&self) -> &[String] {
        match self {
            Self::Function(step) => &step.outputs,
            Self::Container(step) => &step.outputs,
        }
    }

    pub fn is_function_step(&self) -> bool {
        matches!(self, Self::Function(_))
    }

    pub fn is_container_step(&self) -> bool {
        matches!(self, Self::Container(_))
    }
}

impl From<ContainerStep> for WorkflowStep {
    fn from(step: ContainerStep) -> Self {
        Self::Container(step)
    }
}

impl From<FunctionStep> for WorkflowStep {
    fn from(step: FunctionStep) -> Self {
        Self::Function(step)
    }
}

/// Named arguments passed to a step function.
#[derive(Debug, Clone, Default)]
pub struct FunctionArgs {
    values: HashMap<String, Value>,
}

impl FunctionArgs {
    pub fn new(values: HashMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the argument `name`, failing if it was not supplied.
    pub fn value(&self, name: &str) -> Result<&Value, BoxError> {
        self.values
            .get(name)
            .ok_or_else(|| format!("missing argument '{}'", name).into())
    }

    pub fn int(&self, name: &str) -> Result<i64, BoxError> {
        self.value(name)?
            .as_i64()
            .ok_or_else(|| format!("argument '{}' is not an integer", name).into())
    }

    pub fn float(&self, name: &str) -> Result<f64, BoxError> {
        self.value(name)?
            .as_f64()
            .ok_or_else(|| format!("argument '{}' is not a number", name).into())
    }

    pub fn str(&self, name: &str) -> Result<&str, BoxError> {
        self.value(name)?
            .as_str()
            .ok_or_else(|| format!("argument '{}' is not a string", name).into())
    }
}

/// Capture buffer for text a step function writes to its output streams.
#[derive(Debug, Clone, Default)]
pub struct OutputCapture {
    stdout: Vec<String>,
    stderr: Vec<String>,
}

impl OutputCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a line to the captured standard output.
    pub fn print(&mut self, line: impl Into<String>) {
        self.stdout.push(line.into());
    }

    /// Writes a line to the captured standard error.
    pub fn eprint(&mut self, line: impl Into<String>) {
        self.stderr.push(line.into());
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<String>) {
        (self.stdout, self.stderr)
    }
}
