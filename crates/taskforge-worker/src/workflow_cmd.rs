//! `taskforge workflow validate` command (spec §6.3).

use anyhow::{Context, Result};
use taskforge_core::workflow::parser::parse_workflow_toml;

pub fn run_validate(path: &str) -> Result<()> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workflow file at {path}"))?;

    match parse_workflow_toml(&contents, None) {
        Ok(definition) => {
            println!("OK: {}", definition.name);
            println!("  coordination    = {:?}", definition.coordination);
            println!("  max_iterations  = {}", definition.max_iterations);
            println!("  steps           = {}", definition.steps.len());
            for step in &definition.steps {
                println!("    - {} ({})", step.name, step.agent_type);
            }
            Ok(())
        }
        Err(err) => {
            println!("INVALID: {err}");
            anyhow::bail!("workflow definition failed validation");
        }
    }
}
