//! Name -> factory registries for agents, tools, and workflow definitions
//! (spec §4.7, §3.5, and the design notes' "dynamic registry of classes by
//! name" / "singleton caching by class instance" redesigns).
//!
//! Generalizes the teacher's `HarnessRegistry` (`register`/`get`/`list`/
//! `len`/`is_empty`, `Debug` listing only keys) from a single concrete
//! `Box<dyn Harness>` map to a generic factory-cache map, because this
//! system needs three independent namespaces with different concrete
//! traits (`Agent`, `Tool`) plus one plain-data namespace (parsed workflow
//! definitions, which need no factory or cache since they're immutable
//! data -- see [`workflow::WorkflowRegistry`]).

pub mod agent;
pub mod tool;
pub mod workflow;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};

/// Metadata recorded alongside a registered factory.
#[derive(Debug, Clone, Default)]
pub struct RegistryMeta {
    pub description: String,
}

type Factory<T> = Arc<dyn Fn() -> Arc<T> + Send + Sync>;

/// A name -> factory map with a singleton cache, shared by the agent and
/// tool namespaces.
///
/// `get(name)` builds-and-caches on first miss (the "one-time
/// initialization gate" the design notes call for); `new(name)` always
/// calls the factory fresh, bypassing the cache.
pub struct Registry<T: ?Sized> {
    factories: Mutex<HashMap<String, (Factory<T>, RegistryMeta)>>,
    cache: Mutex<HashMap<String, Arc<T>>>,
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self {
            factories: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: ?Sized> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`. First-population-path-wins (spec
    /// §4.7): a second registration under the same name is an error.
    pub fn register(
        &self,
        name: impl Into<String>,
        meta: RegistryMeta,
        factory: impl Fn() -> Arc<T> + Send + Sync + 'static,
    ) -> Result<()> {
        let name = name.into();
        let mut factories = self.factories.lock().expect("registry mutex poisoned");
        if factories.contains_key(&name) {
            bail!("name {name:?} is already registered");
        }
        factories.insert(name, (Arc::new(factory), meta));
        Ok(())
    }

    /// Return the cached instance for `name`, building it on first call.
    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        {
            let cache = self.cache.lock().expect("registry mutex poisoned");
            if let Some(instance) = cache.get(name) {
                return Some(Arc::clone(instance));
            }
        }

        let factory = {
            let factories = self.factories.lock().expect("registry mutex poisoned");
            factories.get(name).map(|(f, _)| Arc::clone(f))
        }?;

        let instance = factory();
        let mut cache = self.cache.lock().expect("registry mutex poisoned");
        Some(Arc::clone(cache.entry(name.to_string()).or_insert(instance)))
    }

    /// Build a fresh instance for `name`, bypassing the cache.
    pub fn new_instance(&self, name: &str) -> Option<Arc<T>> {
        let factories = self.factories.lock().expect("registry mutex poisoned");
        factories.get(name).map(|(f, _)| f())
    }

    pub fn has(&self, name: &str) -> bool {
        self.factories.lock().expect("registry mutex poisoned").contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.factories.lock().expect("registry mutex poisoned").keys().cloned().collect()
    }

    pub fn metadata(&self, name: &str) -> Option<RegistryMeta> {
        self.factories.lock().expect("registry mutex poisoned").get(name).map(|(_, m)| m.clone())
    }

    pub fn len(&self) -> usize {
        self.factories.lock().expect("registry mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn registry_starts_empty() {
        let registry: Registry<str> = Registry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn register_duplicate_name_errors() {
        let registry: Registry<u32> = Registry::new();
        registry
            .register("alpha", RegistryMeta::default(), || Arc::new(1))
            .unwrap();
        let err = registry.register("alpha", RegistryMeta::default(), || Arc::new(2));
        assert!(err.is_err());
    }

    #[test]
    fn get_caches_first_build() {
        let build_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&build_count);
        let registry: Registry<u32> = Registry::new();
        registry
            .register("alpha", RegistryMeta::default(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Arc::new(42)
            })
            .unwrap();

        let first = registry.get("alpha").unwrap();
        let second = registry.get("alpha").unwrap();
        assert_eq!(*first, 42);
        assert_eq!(*second, 42);
        assert_eq!(build_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn new_instance_bypasses_cache() {
        let build_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&build_count);
        let registry: Registry<u32> = Registry::new();
        registry
            .register("alpha", RegistryMeta::default(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Arc::new(7)
            })
            .unwrap();

        registry.new_instance("alpha");
        registry.new_instance("alpha");
        assert_eq!(build_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn get_missing_returns_none() {
        let registry: Registry<u32> = Registry::new();
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn list_returns_all_names() {
        let registry: Registry<u32> = Registry::new();
        registry.register("alpha", RegistryMeta::default(), || Arc::new(1)).unwrap();
        registry.register("beta", RegistryMeta::default(), || Arc::new(2)).unwrap();
        let mut names = registry.list();
        names.sort();
        assert_eq!(names, vec!["alpha", "beta"]);
    }
}
