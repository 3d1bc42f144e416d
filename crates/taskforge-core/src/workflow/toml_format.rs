//! TOML format types for declarative workflow definition files (spec §6.3).
//!
//! These map directly to the on-disk format and are deserialized via
//! `serde` + the `toml` crate, mirroring the teacher's `PlanToml`/
//! `TaskToml` pair in `plan::toml_format`.

use serde::{Deserialize, Serialize};

/// Top-level structure of a workflow definition file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowToml {
    /// Workflow name; must match the file's base name (spec §6.3).
    pub name: String,
    pub description: String,
    pub coordination: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convergence_check: Option<String>,
    pub steps: Vec<StepToml>,
}

/// A single `[[steps]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepToml {
    pub agent_type: String,
    pub name: String,
}

fn default_max_iterations() -> i32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_minimal_workflow() {
        let toml_str = r#"
name = "research_report"
description = "Research then assess."
coordination = "SEQUENTIAL"

[[steps]]
agent_type = "research"
name = "research"

[[steps]]
agent_type = "assessment"
name = "assessment"
"#;
        let wf: WorkflowToml = toml::from_str(toml_str).expect("should parse");
        assert_eq!(wf.name, "research_report");
        assert_eq!(wf.max_iterations, 1);
        assert_eq!(wf.steps.len(), 2);
        assert!(wf.convergence_check.is_none());
    }

    #[test]
    fn deserialize_iterative_workflow() {
        let toml_str = r#"
name = "research_refine"
description = "Iterate until approved."
coordination = "ITERATIVE_REFINEMENT"
max_iterations = 3
convergence_check = "assessment_approved"

[[steps]]
agent_type = "research"
name = "research"

[[steps]]
agent_type = "assessment"
name = "assessment"
"#;
        let wf: WorkflowToml = toml::from_str(toml_str).expect("should parse");
        assert_eq!(wf.max_iterations, 3);
        assert_eq!(wf.convergence_check.as_deref(), Some("assessment_approved"));
    }

    #[test]
    fn roundtrip_serialize_deserialize() {
        let wf = WorkflowToml {
            name: "rt".to_string(),
            description: "roundtrip".to_string(),
            coordination: "SEQUENTIAL".to_string(),
            max_iterations: 1,
            convergence_check: None,
            steps: vec![StepToml {
                agent_type: "research".to_string(),
                name: "research".to_string(),
            }],
        };
        let serialized = toml::to_string(&wf).expect("should serialize");
        let deserialized: WorkflowToml = toml::from_str(&serialized).expect("should deserialize");
        assert_eq!(wf, deserialized);
    }
}
