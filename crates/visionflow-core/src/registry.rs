//! Module registry: node type string → factory. Lookups are
//! case-insensitive; unknown types are the caller's problem (the executor
//! skips them for forward compatibility).

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::module::{Module, NodeSeed};
use crate::modules;

pub type ModuleFactory = fn(NodeSeed) -> Box<dyn Module>;

#[derive(Default)]
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, node_type: &str, factory: ModuleFactory) {
        if node_type.is_empty() {
            return;
        }
        self.factories.insert(node_type.to_lowercase(), factory);
    }

    pub fn get(&self, node_type: &str) -> Option<ModuleFactory> {
        self.factories.get(&node_type.to_lowercase()).copied()
    }

    pub fn has(&self, node_type: &str) -> bool {
        self.factories.contains_key(&node_type.to_lowercase())
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Registry with every built-in module registered under all its
    /// aliases.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        modules::register_builtin(&mut reg);
        reg
    }
}

static BUILTIN: Lazy<ModuleRegistry> = Lazy::new(ModuleRegistry::builtin);

/// The process-wide built-in registry.
pub fn builtin() -> &'static ModuleRegistry {
    &BUILTIN
}
