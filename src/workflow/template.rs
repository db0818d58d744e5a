//! Workflow Templates and Run Arguments
//!
//! A resolved workflow template (ordered steps, default parameters and
//! declared result files) and the user-supplied arguments of a run.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::volume::{FsFile, IoHandle, StorageVolume};

use super::model::{Context, WorkflowStep};

/// Resolved serial workflow ready for execution.
#[derive(Debug, Clone, Default)]
pub struct WorkflowTemplate {
    pub steps: Vec<WorkflowStep>,

    /// Static files of the template, copied into every run folder
    pub inputs: Vec<String>,

    /// Default run arguments, overridden by user arguments
    pub parameters: Context,

    /// Files (or folders) that make up the run result
    pub outputs: Vec<String>,
}

impl WorkflowTemplate {
    pub fn new(steps: Vec<WorkflowStep>) -> Self {
        Self {
            steps,
            ..Default::default()
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
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

/// A file uploaded for a run, stored under `target` in the run folder.
#[derive(Clone)]
pub struct InputFile {
    pub source: Arc<dyn IoHandle>,
    pub target: String,
}

impl InputFile {
    pub fn new(source: Arc<dyn IoHandle>, target: impl Into<String>) -> Self {
        Self {
            source,
            target: target.into(),
        }
    }

    /// Input file read from the local file system.
    pub fn from_path(path: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self::new(Arc::new(FsFile::new(path)), target)
    }

    /// Copies the file into `store`, returning the written keys.
    pub fn copy(&self, store: &dyn StorageVolume) -> Result<Vec<String>> {
        store.store(self.source.as_ref(), &self.target)?;
        Ok(vec![self.target.clone()])
    }
}

impl fmt::Debug for InputFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputFile")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Value of a single run argument.
#[derive(Debug, Clone)]
pub enum RunArgument {
    /// Plain value placed in the context
    Value(Value),

    /// Uploaded file; the context receives its target path
    File(InputFile),

    /// Value with attached files that are copied into the run folder
    Actor { value: Value, files: Vec<InputFile> },
}

impl RunArgument {
    /// Context value of the argument.
    pub fn context_value(&self) -> Value {
        match self {
            Self::Value(value) => value.clone(),
            Self::File(file) => Value::String(file.target.clone()),
            Self::Actor { value, .. } => value.clone(),
        }
    }

    /// Files that have to be copied into the run folder.
    pub fn files(&self) -> &[InputFile] {
        match self {
            Self::Value(_) => &[],
            Self::File(file) => std::slice::from_ref(file),
            Self::Actor { files, .. } => files,
        }
    }
}

impl From<Value> for RunArgument {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// Run arguments keyed by parameter name.
pub type RunArguments = HashMap<String, RunArgument>;
