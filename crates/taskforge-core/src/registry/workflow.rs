//! Name -> [`WorkflowDefinition`] map.
//!
//! Unlike the agent/tool registries, workflow definitions are immutable
//! data parsed once at startup (spec §6.3) -- there is no factory function
//! and nothing to cache, so this is a plain `register`/`get` map rather
//! than an instance of the generic [`super::Registry`].

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Result, bail};

use crate::workflow::WorkflowDefinition;

#[derive(Default, Debug)]
pub struct WorkflowRegistry {
    definitions: Mutex<HashMap<String, WorkflowDefinition>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, definition: WorkflowDefinition) -> Result<()> {
        let mut definitions = self.definitions.lock().expect("registry mutex poisoned");
        if definitions.contains_key(&definition.name) {
            bail!("workflow {:?} is already registered", definition.name);
        }
        definitions.insert(definition.name.clone(), definition);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<WorkflowDefinition> {
        self.definitions.lock().expect("registry mutex poisoned").get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.definitions.lock().expect("registry mutex poisoned").contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.definitions.lock().expect("registry mutex poisoned").keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{WorkflowDefinition, WorkflowStep};
    use taskforge_db::models::WorkflowCoordination;

    fn sample(name: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            name: name.to_string(),
            description: "test".to_string(),
            coordination: WorkflowCoordination::Sequential,
            max_iterations: 1,
            convergence_check: None,
            steps: vec![WorkflowStep {
                agent_type: "research".to_string(),
                name: "research".to_string(),
            }],
        }
    }

    #[test]
    fn register_and_get_roundtrip() {
        let registry = WorkflowRegistry::new();
        registry.register(sample("report")).unwrap();
        let found = registry.get("report").unwrap();
        assert_eq!(found.name, "report");
    }

    #[test]
    fn duplicate_registration_errors() {
        let registry = WorkflowRegistry::new();
        registry.register(sample("report")).unwrap();
        assert!(registry.register(sample("report")).is_err());
    }

    #[test]
    fn get_missing_returns_none() {
        let registry = WorkflowRegistry::new();
        assert!(registry.get("missing").is_none());
    }
}
