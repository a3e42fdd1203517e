//! Submission Validation
//!
//! Checks a pipeline request before anything executes:
//! - The step list is not empty
//! - Step names are present and unique
//! - Steps that require input files declare where they come from
//! - Every step reference in an input mapping points at an earlier step
//!
//! Any failure here is a configuration error: the pipeline is recorded as
//! `failed` without creating or attempting any step.

use std::collections::HashSet;
use std::fmt;

use log::{debug, info, warn};

use super::chain::{ChainError, DependencyChain};
use super::model::{PipelineRequest, StepDefinition};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyPipeline,
    EmptyPipelineName,
    EmptyStepName(usize),
    DuplicateStepName(String),
    MissingInputMapping(String),
    EmptyResultField { step: String, input: String },
    InvalidReference(ChainError),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyPipeline => write!(f, "Pipeline has no steps"),
            Self::EmptyPipelineName => write!(f, "Pipeline name is empty"),
            Self::EmptyStepName(position) => {
                write!(f, "Step at position {} has an empty name", position)
            }
            Self::DuplicateStepName(name) => write!(f, "Duplicate step name: '{}'", name),
            Self::MissingInputMapping(step) => write!(
                f,
                "Step '{}' requires an input file but declares no input mapping",
                step
            ),
            Self::EmptyResultField { step, input } => write!(
                f,
                "Step '{}' input '{}' references an empty result field name",
                step, input
            ),
            Self::InvalidReference(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Joins validation errors into one message, one error per line.
pub fn describe(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Validates a single step's fields.
fn validate_step(position: usize, step: &StepDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if step.name.trim().is_empty() {
        errors.push(ValidationError::EmptyStepName(position));
        return errors;
    }

    if step.requires_input_file && step.input_mapping.is_empty() {
        errors.push(ValidationError::MissingInputMapping(step.name.clone()));
    }

    if !step.requires_input_file && !step.input_mapping.is_empty() {
        warn!(
            "Step '{}': input mapping declared but requires_input_file is false",
            step.name
        );
    }

    for (input, source) in &step.input_mapping {
        if let Some((_, field)) = source.step_reference(input) {
            if field.trim().is_empty() {
                errors.push(ValidationError::EmptyResultField {
                    step: step.name.clone(),
                    input: input.clone(),
                });
            }
        }
    }

    errors
}

/// Validates a submission and returns its dependency chain.
///
/// Performs the following checks:
/// 1. Pipeline has a name and at least one step
/// 2. Step names are non-empty and unique
/// 3. Every step's fields are consistent
/// 4. Every step reference points at a strictly earlier step
pub fn validate_request(
    request: &PipelineRequest,
) -> Result<DependencyChain, Vec<ValidationError>> {
    info!(
        "Validating pipeline '{}' with {} steps",
        request.name,
        request.steps.len()
    );

    let mut errors = Vec::new();

    if request.name.trim().is_empty() {
        errors.push(ValidationError::EmptyPipelineName);
    }

    if request.steps.is_empty() {
        errors.push(ValidationError::EmptyPipeline);
        return Err(errors);
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for (position, step) in request.steps.iter().enumerate() {
        errors.extend(validate_step(position, step));

        if !step.name.trim().is_empty() && !seen.insert(step.name.as_str()) {
            errors.push(ValidationError::DuplicateStepName(step.name.clone()));
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    let chain = DependencyChain::build(
        request
            .steps
            .iter()
            .map(|s| (s.name.as_str(), &s.input_mapping)),
    )
    .map_err(|e| vec![ValidationError::InvalidReference(e)])?;

    debug!(
        "Pipeline '{}' dependency edges: {:?}",
        request.name,
        chain.edges()
    );

    Ok(chain)
}
