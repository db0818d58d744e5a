//! Workflow Validation
//!
//! Structural checks for serial workflows before they are executed:
//! - Workflow is not empty
//! - Step names are present and unique
//! - Container steps name an environment and have commands
//! - Step inputs are available (warning only)

use std::collections::HashSet;

use log::{debug, info, warn};

use crate::error::{FlowError, Result};

use super::model::WorkflowStep;
use super::template::WorkflowTemplate;

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyWorkflow,
    DuplicateStepName(String),
    EmptyStepName,
    EmptyImage(String),
    NoCommands(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyWorkflow => write!(f, "Workflow has no steps"),
            Self::DuplicateStepName(name) => write!(f, "Duplicate step name: '{}'", name),
            Self::EmptyStepName => write!(f, "Step has empty or whitespace-only name"),
            Self::EmptyImage(step) => {
                write!(f, "Step '{}' has no execution environment specified", step)
            }
            Self::NoCommands(step) => write!(f, "Step '{}' has no commands", step),
        }
    }
}

/// Validates a single step's fields.
fn validate_step(step: &WorkflowStep) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.name().trim().is_empty() {
        errors.push(ValidationError::EmptyStepName);
        return errors;
    }

    if let WorkflowStep::Container(container) = step {
        if container.image.trim().is_empty() {
            errors.push(ValidationError::EmptyImage(container.name.clone()));
        }
        if container.commands.iter().all(|c| c.trim().is_empty()) {
            errors.push(ValidationError::NoCommands(container.name.clone()));
        }
    }

    errors
}

/// Validates the structure of a workflow template.
///
/// Inputs that are neither static template files nor outputs of an
/// earlier step only produce a warning, since they may be supplied as
/// run arguments.
pub fn validate_workflow(template: &WorkflowTemplate) -> Result<()> {
    info!("Validating workflow with {} steps", template.steps.len());

    if template.steps.is_empty() {
        return Err(FlowError::InvalidWorkflow(
            ValidationError::EmptyWorkflow.to_string(),
        ));
    }

    let mut errors = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for step in &template.steps {
        errors.extend(validate_step(step));
        if !step.name().trim().is_empty() && !seen.insert(step.name()) {
            errors.push(ValidationError::DuplicateStepName(step.name().to_string()));
        }
    }

    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(FlowError::InvalidWorkflow(messages.join("\n")));
    }

    check_inputs(template);

    info!("Workflow validated: {} steps", template.steps.len());
    Ok(())
}

/// Warns about step inputs that nothing earlier in the workflow provides.
fn check_inputs(template: &WorkflowTemplate) {
    let mut available: Vec<&str> = template.inputs.iter().map(String::as_str).collect();
    for step in &template.steps {
        for input in step.inputs() {
            let provided = available
                .iter()
                .any(|f| *f == input.as_str() || input.starts_with(*f) || f.starts_with(input.as_str()));
            if !provided {
                warn!(
                    "Step '{}': input '{}' is not provided by the template or an earlier step",
                    step.name(),
                    input
                );
            }
        }
        available.extend(step.outputs().iter().map(String::as_str));
    }
    debug!("{} files available after all steps", available.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::ContainerStep;

    fn step(name: &str) -> WorkflowStep {
        ContainerStep::new(name, "python:3.9")
            .with_command("python run.py")
            .into()
    }

    #[test]
    fn test_valid_workflow() {
        let template = WorkflowTemplate::new(vec![step("s1"), step("s2")]);
        assert!(validate_workflow(&template).is_ok());
    }

    #[test]
    fn test_empty_workflow() {
        let result = validate_workflow(&WorkflowTemplate::default());
        assert!(matches!(result, Err(FlowError::InvalidWorkflow(_))));
    }

    #[test]
    fn test_duplicate_step_names() {
        let template = WorkflowTemplate::new(vec![step("s1"), step("s1")]);
        let err = validate_workflow(&template).unwrap_err();
        assert!(err.to_string().contains("Duplicate step name: 's1'"));
    }

    #[test]
    fn test_container_step_fields() {
        let bad = ContainerStep::new("s1", " ");
        let errors = validate_step(&bad.into());
        assert_eq!(
            errors,
            vec![
                ValidationError::EmptyImage("s1".into()),
                ValidationError::NoCommands("s1".into())
            ]
        );

        let unnamed = ContainerStep::new("", "img").with_command("ls");
        assert_eq!(validate_step(&unnamed.into()), vec![ValidationError::EmptyStepName]);
    }
}
