//! Workflow TOML parser with validation (spec §6.3).
//!
//! Parses a workflow definition string into a [`super::WorkflowDefinition`]
//! and validates:
//! - `coordination` is a known variant.
//! - Step names are unique within the workflow.
//! - `max_iterations` is a positive integer.
//!
//! Grounded directly on the teacher's `plan::parser::parse_plan_toml`, minus
//! dependency-cycle detection: spec §4.6 models a workflow's steps as a flat
//! ordered list per iteration, not a dependency graph, so there is nothing
//! to topologically sort.

use std::collections::HashSet;
use std::str::FromStr;

use taskforge_db::models::WorkflowCoordination;
use thiserror::Error;

use super::toml_format::WorkflowToml;
use super::{WorkflowDefinition, WorkflowStep};

/// Errors that can occur during workflow parsing and validation.
#[derive(Debug, Error)]
pub enum WorkflowParseError {
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("workflow must contain at least one step")]
    NoSteps,

    #[error("duplicate step name: {0:?}")]
    DuplicateStepName(String),

    #[error("invalid coordination mode {value:?} (expected SEQUENTIAL or ITERATIVE_REFINEMENT)")]
    InvalidCoordination { value: String },

    #[error("max_iterations must be a positive integer, got {0}")]
    InvalidMaxIterations(i32),

    #[error("workflow name {name:?} does not match file name {expected:?}")]
    NameMismatch { name: String, expected: String },
}

/// Parse and validate a workflow definition string.
///
/// `expected_name`, when given, is the file's base name (without
/// extension); the parsed `name` field must match it (spec §6.3: "name
/// matches file base name").
pub fn parse_workflow_toml(
    content: &str,
    expected_name: Option<&str>,
) -> Result<WorkflowDefinition, WorkflowParseError> {
    let raw: WorkflowToml = toml::from_str(content)?;
    validate(&raw, expected_name)?;

    let coordination = WorkflowCoordination::from_str(&raw.coordination.to_lowercase())
        .map_err(|_| WorkflowParseError::InvalidCoordination {
            value: raw.coordination.clone(),
        })?;

    Ok(WorkflowDefinition {
        name: raw.name,
        description: raw.description,
        coordination,
        max_iterations: raw.max_iterations,
        convergence_check: raw.convergence_check,
        steps: raw
            .steps
            .into_iter()
            .map(|s| WorkflowStep {
                agent_type: s.agent_type,
                name: s.name,
            })
            .collect(),
    })
}

fn validate(raw: &WorkflowToml, expected_name: Option<&str>) -> Result<(), WorkflowParseError> {
    if let Some(expected) = expected_name {
        if raw.name != expected {
            return Err(WorkflowParseError::NameMismatch {
                name: raw.name.clone(),
                expected: expected.to_string(),
            });
        }
    }

    if raw.steps.is_empty() {
        return Err(WorkflowParseError::NoSteps);
    }

    let mut seen = HashSet::new();
    for step in &raw.steps {
        if !seen.insert(&step.name) {
            return Err(WorkflowParseError::DuplicateStepName(step.name.clone()));
        }
    }

    if WorkflowCoordination::from_str(&raw.coordination.to_lowercase()).is_err() {
        return Err(WorkflowParseError::InvalidCoordination {
            value: raw.coordination.clone(),
        });
    }

    if raw.max_iterations < 1 {
        return Err(WorkflowParseError::InvalidMaxIterations(raw.max_iterations));
    }

    Ok(())
}
