//! Declarative multi-agent workflow definitions (spec §4.6, §6.3).
//!
//! A [`WorkflowDefinition`] is immutable data parsed from a TOML file at
//! startup and registered into a [`crate::registry::workflow::WorkflowRegistry`].
//! The orchestrator (`crate::orchestrator`) walks a definition's steps to
//! drive subtask creation; this module owns only the data shape, parsing,
//! and the convergence-check function registry.

pub mod parser;
pub mod toml_format;

use taskforge_db::models::WorkflowCoordination;

/// A parsed, validated workflow definition.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub name: String,
    pub description: String,
    pub coordination: WorkflowCoordination,
    pub max_iterations: i32,
    /// Name of a registered convergence-check function (spec §4.6); only
    /// meaningful when `coordination` is `IterativeRefinement`.
    pub convergence_check: Option<String>,
    pub steps: Vec<WorkflowStep>,
}

/// A single step within a workflow iteration: run `agent_type`, recording
/// its output under `name` in the accumulated workflow state.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowStep {
    pub agent_type: String,
    pub name: String,
}

/// A pure function evaluating accumulated step output to decide whether an
/// iterative-refinement workflow has converged (spec §4.6, §9 Q1).
pub type ConvergenceCheck = fn(&serde_json::Value) -> bool;

/// Built-in convergence checks, keyed by the name used in a workflow's
/// `convergence_check` field. There is exactly one built-in today; concrete
/// assessment semantics live in the agent implementation, out of scope for
/// this crate (spec §1) -- this just inspects the shape it produces.
pub fn lookup_convergence_check(name: &str) -> Option<ConvergenceCheck> {
    match name {
        "assessment_approved" => Some(assessment_approved as ConvergenceCheck),
        _ => None,
    }
}

/// Converged when the last step's output has `"approved": true`.
fn assessment_approved(accumulated: &serde_json::Value) -> bool {
    accumulated
        .get("approved")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}
