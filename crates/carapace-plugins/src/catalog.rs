//! Tool catalog: the routable `{tool name -> declaration, owning plugin,
//! handler}` table the router consults on every `tool.invoke.*` dispatch.
//!
//! Grounded on the teacher's `gateway/src/nodes/registry.rs::NodeRegistry`:
//! a `DashMap` for the hot lookup path (`get`, `contains`, `snapshot`) plus
//! explicit register/unregister calls that run under the plugin host's own
//! serialization (load/unload/reload never run concurrently with each
//! other), so no additional locking is needed around mutation itself.

use std::sync::Arc;

use carapace_domain::tool::ToolDeclaration;
use dashmap::DashMap;
use thiserror::Error;

use crate::host::PluginHandler;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("tool '{0}' is already registered")]
    AlreadyRegistered(String),
}

#[derive(Clone)]
pub struct CatalogEntry {
    pub declaration: ToolDeclaration,
    pub plugin_name: String,
    pub handler: Arc<dyn PluginHandler>,
}

pub struct ToolCatalog {
    entries: DashMap<String, CatalogEntry>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    pub fn contains(&self, tool_name: &str) -> bool {
        self.entries.contains_key(tool_name)
    }

    pub fn register(&self, plugin_name: &str, declaration: ToolDeclaration, handler: Arc<dyn PluginHandler>) -> Result<(), CatalogError> {
        if self.entries.contains_key(&declaration.name) {
            return Err(CatalogError::AlreadyRegistered(declaration.name));
        }
        self.entries.insert(
            declaration.name.clone(),
            CatalogEntry {
                declaration,
                plugin_name: plugin_name.to_string(),
                handler,
            },
        );
        Ok(())
    }

    /// Removes every tool owned by `plugin_name`. Safe to call even if the
    /// plugin registered nothing, or partially failed mid-registration.
    pub fn unregister_plugin(&self, plugin_name: &str) {
        self.entries.retain(|_, entry| entry.plugin_name != plugin_name);
    }

    pub fn get(&self, tool_name: &str) -> Option<CatalogEntry> {
        self.entries.get(tool_name).map(|e| e.clone())
    }

    /// Used by the `list_tools` intrinsic. Order is not significant to
    /// callers; `DashMap` iteration order is not guaranteed stable.
    pub fn snapshot(&self) -> Vec<ToolDeclaration> {
        self.entries.iter().map(|e| e.declaration.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::new()
    }
}
