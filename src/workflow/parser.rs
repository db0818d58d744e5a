//! Workflow Parser
//!
//! Loads serial workflow definitions from YAML files.
//!
//! # Example YAML Format
//!
//! ```yaml
//! workflow:
//!   files:
//!     inputs:
//!       - code/analyze.py
//!       - data/names.txt
//!     outputs:
//!       - results/
//!   parameters:
//!     greeting: Hello
//!   steps:
//!     - name: say_hello
//!       files:
//!         inputs: [code/analyze.py, data/names.txt]
//!         outputs: [results/greetings.txt]
//!       action:
//!         environment: python:3.9
//!         commands:
//!           - ${python} code/analyze.py $greeting data/names.txt
//!     - name: count
//!       action:
//!         func: count_lines
//!         arg: total
//!         vars:
//!           - arg: filename
//!             var: outfile
//! ```
//!
//! Container actions carry `environment` and `commands`; function actions
//! reference a callable registered in a [`FunctionRegistry`].

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::{debug, info};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{BoxError, FlowError, Result};

use super::model::{
    single_or_vec, ContainerStep, FunctionArgs, FunctionStep, OutputCapture, StepFunction,
    WorkflowStep,
};
use super::template::WorkflowTemplate;
use super::validator::validate_workflow;

/// Named step functions that workflow documents may reference.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, (Vec<String>, StepFunction)>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `func` with its formal parameter names under `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, params: &[&str], func: F)
    where
        F: Fn(&FunctionArgs, &mut OutputCapture) -> std::result::Result<Value, BoxError>
            + Send
            + Sync
            + 'static,
    {
        let params = params.iter().map(|p| p.to_string()).collect();
        self.functions
            .insert(name.into(), (params, std::sync::Arc::new(func)));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    fn get(&self, name: &str) -> Option<&(Vec<String>, StepFunction)> {
        self.functions.get(name)
    }
}

#[derive(Deserialize)]
struct WorkflowDocument {
    workflow: WorkflowSpec,
}

#[derive(Deserialize, Default)]
struct WorkflowSpec {
    #[serde(default)]
    files: FileSpec,
    #[serde(default)]
    parameters: HashMap<String, Value>,
    #[serde(default)]
    steps: Vec<StepSpec>,
}

#[derive(Deserialize, Default)]
struct FileSpec {
    #[serde(deserialize_with = "single_or_vec", default)]
    inputs: Vec<String>,
    #[serde(deserialize_with = "single_or_vec", default)]
    outputs: Vec<String>,
}

#[derive(Deserialize)]
struct StepSpec {
    name: String,
    #[serde(default)]
    files: FileSpec,
    action: ActionSpec,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ActionSpec {
    Container {
        environment: String,
        commands: Vec<String>,
        #[serde(default)]
        env: HashMap<String, Value>,
    },
    Function {
        func: String,
        #[serde(default)]
        arg: Option<String>,
        #[serde(default)]
        vars: Vec<VarSpec>,
    },
}

#[derive(Deserialize)]
struct VarSpec {
    arg: String,
    var: String,
}

/// Renders a scalar YAML value as an environment variable value.
fn env_value(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Parses a serial workflow document.
///
/// # Arguments
///
/// * `content` - YAML (or JSON) text of the workflow document
/// * `functions` - Callables that function steps may reference
///
/// # Returns
///
/// * `Ok(WorkflowTemplate)` - Parsed and validated workflow
/// * `Err` - Parse or validation error
pub fn parse_workflow(content: &str, functions: &FunctionRegistry) -> Result<WorkflowTemplate> {
    let doc: WorkflowDocument = serde_yaml::from_str(content)?;
    let spec = doc.workflow;

    let mut steps = Vec::with_capacity(spec.steps.len());
    for step in spec.steps {
        let parsed: WorkflowStep = match step.action {
            ActionSpec::Container {
                environment,
                commands,
                env,
            } => {
                let mut container = ContainerStep::new(step.name, environment).with_commands(commands);
                container.env = env.into_iter().map(|(k, v)| (k, env_value(v))).collect();
                container.inputs = step.files.inputs;
                container.outputs = step.files.outputs;
                container.into()
            }
            ActionSpec::Function { func, arg, vars } => {
                let (params, callable) = functions.get(&func).ok_or_else(|| {
                    FlowError::InvalidWorkflow(format!(
                        "Step '{}' references unknown function '{}'",
                        step.name, func
                    ))
                })?;
                FunctionStep {
                    name: step.name,
                    func: callable.clone(),
                    params: params.clone(),
                    output: arg,
                    varnames: vars.into_iter().map(|v| (v.arg, v.var)).collect(),
                    inputs: step.files.inputs,
                    outputs: step.files.outputs,
                }
                .into()
            }
        };
        debug!("Parsed step '{}'", parsed.name());
        steps.push(parsed);
    }

    let template = WorkflowTemplate {
        steps,
        inputs: spec.files.inputs,
        parameters: spec.parameters.into_iter().collect(),
        outputs: spec.files.outputs,
    };
    validate_workflow(&template)?;
    Ok(template)
}

/// Loads a workflow from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::workflow::{load_workflow, FunctionRegistry};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let template = load_workflow("workflow.yaml", &FunctionRegistry::new())?;
///     println!("Loaded {} steps", template.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>, functions: &FunctionRegistry) -> Result<WorkflowTemplate> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| {
        FlowError::InvalidWorkflow(format!(
            "Failed to read workflow file '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        ))
    })?;
    debug!("YAML content loaded ({} bytes)", content.len());

    let template = parse_workflow(&content, functions)?;
    info!(
        "Parsed {} steps, {} static files, {} result files",
        template.steps.len(),
        template.inputs.len(),
        template.outputs.len()
    );
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    const WORKFLOW: &str = r#"
workflow:
  files:
    inputs: [code/helloworld.py, data/names.txt]
    outputs: results/
  parameters:
    sleeptime: 2
    greeting: Hello
  steps:
    - name: hello
      files:
        inputs: [code/helloworld.py, data/names.txt]
        outputs: [results/greetings.txt]
      action:
        environment: python:3.9
        commands:
          - ${python} code/helloworld.py --inputfile data/names.txt --sleeptime $sleeptime
        env:
          DEBUG: 1
    - name: count
      action:
        func: count
        arg: total
        vars:
          - arg: n
            var: sleeptime
"#;

    fn registry() -> FunctionRegistry {
        let mut functions = FunctionRegistry::new();
        functions.register("count", &["n"], |args, _| Ok(json!(args.int("n")? + 1)));
        functions
    }

    #[test]
    fn test_parse_workflow() {
        let template = parse_workflow(WORKFLOW, &registry()).unwrap();

        assert_eq!(template.steps.len(), 2);
        assert_eq!(template.inputs, vec!["code/helloworld.py", "data/names.txt"]);
        assert_eq!(template.outputs, vec!["results/"]);
        assert_eq!(template.parameters["sleeptime"], json!(2));

        match &template.steps[0] {
            WorkflowStep::Container(step) => {
                assert_eq!(step.image, "python:3.9");
                assert_eq!(step.commands.len(), 1);
                assert_eq!(step.env["DEBUG"], "1");
                assert_eq!(step.outputs, vec!["results/greetings.txt"]);
            }
            other => panic!("unexpected step {:?}", other),
        }
        match &template.steps[1] {
            WorkflowStep::Function(step) => {
                assert_eq!(step.output.as_deref(), Some("total"));
                assert_eq!(step.varnames["n"], "sleeptime");
                assert_eq!(step.params, vec!["n"]);
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_unknown_function() {
        let result = parse_workflow(WORKFLOW, &FunctionRegistry::new());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("unknown function 'count'"));
    }

    #[test]
    fn test_invalid_action() {
        let doc = "workflow:\n  steps:\n    - name: s1\n      action: {image: x}\n";
        assert!(parse_workflow(doc, &registry()).is_err());
    }

    #[test]
    fn test_load_workflow_file() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("workflow.yaml");
        std::fs::write(&path, WORKFLOW).unwrap();

        let template = load_workflow(&path, &registry()).unwrap();
        assert_eq!(template.steps.len(), 2);

        assert!(load_workflow(tmp.path().join("missing.yaml"), &registry()).is_err());
    }
}
