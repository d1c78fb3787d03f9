//! Plugin host: the contract a handler satisfies, the per-plugin load
//! sequence (manifest validate -> uniqueness -> handler ready ->
//! manifest/handler agreement -> `initialize` under timeout -> catalog
//! registration), and reload/unload.
//!
//! Per `SPEC_FULL.md` §9's redesign note, there is no dynamic module
//! import: built-in plugins are `Arc<dyn PluginHandler>` values
//! constructed at `Supervisor` startup; user plugins are out-of-process
//! peers that already hold a connected handler-role identity by the time
//! `PluginHost::load` is called. Grounded on `sa-skills::registry`'s
//! `RwLock<Vec<Entry>>` registry discipline, generalized from skills to
//! plugins.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use carapace_domain::envelope::{EventEnvelope, Group};
use carapace_domain::error::CoreError;
use carapace_domain::AuditLog;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::catalog::ToolCatalog;
use crate::manifest::PluginManifest;

/// Context passed to a handler on each invocation. Deliberately narrow —
/// only what the router pipeline trusts, per `SPEC_FULL.md` §4.2 stage 8.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub group: Group,
    pub session_id: String,
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

/// Looks up a prior Claude session id for the `explicit` session policy,
/// without giving plugins direct access to the session store.
pub trait SessionLookup: Send + Sync {
    fn lookup(&self, group: &Group) -> Option<Uuid>;
}

/// Read-only view of another subsystem's session info, injected into
/// `CoreServices` so `carapace-plugins` need not depend on
/// `carapace-sessions` (which itself depends on the tool catalog here).
pub trait SessionInfoQuery: Send + Sync {
    fn session_started_at(&self, group: &Group) -> Option<DateTime<Utc>>;
}

/// `{audit query scoped to group, tool catalog read, session info,
/// credential reader}` — handed to a plugin's `initialize`.
pub struct CoreServices {
    pub group: Group,
    pub audit: Arc<AuditLog>,
    pub catalog: Arc<ToolCatalog>,
    pub session_info: Arc<dyn SessionInfoQuery>,
    credentials_root: PathBuf,
}

impl CoreServices {
    pub fn new(
        group: Group,
        audit: Arc<AuditLog>,
        catalog: Arc<ToolCatalog>,
        session_info: Arc<dyn SessionInfoQuery>,
        credentials_root: PathBuf,
    ) -> Self {
        Self {
            group,
            audit,
            catalog,
            session_info,
            credentials_root,
        }
    }

    /// `${credentialsRoot}/plugins/{pluginName}/{key}`. The key must
    /// contain no `/`, no `..`, no NUL; the file is opened through a path
    /// that refuses to follow symlinks. On any mismatch, an error that
    /// never includes the credential value is returned.
    pub fn read_credential(&self, plugin_name: &str, key: &str) -> Result<Vec<u8>, CoreError> {
        crate::credentials::read_credential(&self.credentials_root, plugin_name, key)
    }
}

#[async_trait]
pub trait PluginHandler: Send + Sync {
    /// Called once, before any invocation. Enforced by the caller's
    /// timeout (default 10s); elapsing maps to `LoadFailureCategory::Timeout`.
    async fn initialize(&self, services: Arc<CoreServices>) -> Result<(), CoreError>;

    /// Must be idempotent up to external side effects the plugin itself
    /// chooses to make.
    async fn handle_tool_invocation(
        &self,
        tool: &str,
        args: serde_json::Value,
        context: InvocationContext,
    ) -> Result<serde_json::Value, CoreError>;

    /// Called on supervisor stop; bounded timeout (default 5s) then
    /// force-abandon.
    async fn shutdown(&self);

    async fn handle_event(&self, _envelope: &EventEnvelope) {}

    /// Required when the manifest declares `session: "explicit"`.
    async fn resolve_session(&self, _envelope: &EventEnvelope, _lookup: &dyn SessionLookup) -> Option<Uuid> {
        None
    }

    /// Whether this handler implements `resolve_session` — used to enforce
    /// manifest/handler agreement at load step 5, since Rust has no
    /// "feel for a method" duck-typing equivalent.
    fn supports_explicit_session(&self) -> bool {
        false
    }

    async fn verify(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadFailureCategory {
    InvalidManifest,
    InitError,
    Timeout,
    MissingHandler,
}

#[derive(Debug, Clone)]
pub struct PluginLoadResult {
    pub plugin: String,
    pub category: Option<LoadFailureCategory>,
}

impl PluginLoadResult {
    pub fn ok(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            category: None,
        }
    }

    pub fn failed(plugin: impl Into<String>, category: LoadFailureCategory) -> Self {
        Self {
            plugin: plugin.into(),
            category: Some(category),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.category.is_none()
    }
}

struct LoadedPlugin {
    manifest: PluginManifest,
    handler: Arc<dyn PluginHandler>,
}

/// Names that may never be unloaded or overridden by a user plugin.
pub fn is_reserved_plugin_name(name: &str) -> bool {
    matches!(name, "core" | "intrinsics")
}

pub struct PluginHost {
    catalog: Arc<ToolCatalog>,
    loaded: RwLock<std::collections::HashMap<String, LoadedPlugin>>,
    init_timeout: Duration,
    shutdown_timeout: Duration,
}

impl PluginHost {
    pub fn new(catalog: Arc<ToolCatalog>, init_timeout: Duration, shutdown_timeout: Duration) -> Self {
        Self {
            catalog,
            loaded: RwLock::new(std::collections::HashMap::new()),
            init_timeout,
            shutdown_timeout,
        }
    }

    /// The per-plugin load sequence from `SPEC_FULL.md` §4.3. On any
    /// failure, the handler is discarded, no partial catalog entries
    /// remain, and a failure category is returned. A failed plugin never
    /// prevents others from loading — the caller is expected to call
    /// `load` once per discovered plugin and continue past failures.
    pub async fn load(&self, manifest: PluginManifest, handler: Arc<dyn PluginHandler>, services: Arc<CoreServices>) -> PluginLoadResult {
        let name = manifest.name.clone();

        // Steps 1-2: parse (already done by caller) + validate.
        let validation = manifest.validate();
        if !validation.is_valid() {
            tracing::warn!(plugin = %name, errors = ?validation.errors, "plugin manifest invalid");
            return PluginLoadResult::failed(name, LoadFailureCategory::InvalidManifest);
        }

        // Step 3: uniqueness — tool names vs. catalog, and vs. reserved names
        // (reserved-name collision is already checked inside `validate`).
        {
            let loaded = self.loaded.read();
            if loaded.contains_key(&name) || is_reserved_plugin_name(&name) {
                return PluginLoadResult::failed(name, LoadFailureCategory::InvalidManifest);
            }
        }
        for tool in &manifest.provides.tools {
            if self.catalog.contains(&tool.name) {
                return PluginLoadResult::failed(name, LoadFailureCategory::InvalidManifest);
            }
        }

        // Step 4: handler is already constructed/connected by the caller.
        // Failure to obtain one at all maps to MissingHandler; by the time
        // we're called it's a non-null Arc, so this only applies to the
        // explicit-session agreement check below.

        // Step 5: manifest<->handler agreement.
        if manifest.session == Some(carapace_domain::SessionPolicy::Explicit) && !handler.supports_explicit_session() {
            return PluginLoadResult::failed(name, LoadFailureCategory::MissingHandler);
        }

        // Step 6: initialize under timeout.
        match tokio::time::timeout(self.init_timeout, handler.initialize(services)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(plugin = %name, error = %e, "plugin initialize failed");
                return PluginLoadResult::failed(name, LoadFailureCategory::InitError);
            }
            Err(_) => {
                tracing::warn!(plugin = %name, "plugin initialize timed out");
                return PluginLoadResult::failed(name, LoadFailureCategory::Timeout);
            }
        }

        // Step 7: register each tool in the catalog.
        for tool in &manifest.provides.tools {
            if let Err(e) = self.catalog.register(&name, tool.clone(), handler.clone()) {
                tracing::warn!(plugin = %name, tool = %tool.name, error = %e, "catalog registration failed");
                self.catalog.unregister_plugin(&name);
                return PluginLoadResult::failed(name, LoadFailureCategory::InvalidManifest);
            }
        }

        self.loaded.write().insert(name.clone(), LoadedPlugin { manifest, handler });
        PluginLoadResult::ok(name)
    }

    /// Shuts down the handler (bounded), removes its catalog entries, and
    /// clears internal state. Built-in/reserved plugins are refused.
    pub async fn unload(&self, name: &str) -> Result<(), CoreError> {
        if is_reserved_plugin_name(name) {
            return Err(CoreError::Internal(format!("cannot unload reserved plugin '{name}'")));
        }
        let plugin = self.loaded.write().remove(name);
        let Some(plugin) = plugin else {
            return Err(CoreError::Internal(format!("plugin '{name}' is not loaded")));
        };
        if tokio::time::timeout(self.shutdown_timeout, plugin.handler.shutdown()).await.is_err() {
            tracing::warn!(plugin = %name, "plugin shutdown timed out; force-abandoning");
        }
        self.catalog.unregister_plugin(name);
        Ok(())
    }

    /// Unloads then reloads from the given (already re-read) manifest and
    /// handler.
    pub async fn reload(&self, name: &str, manifest: PluginManifest, handler: Arc<dyn PluginHandler>, services: Arc<CoreServices>) -> PluginLoadResult {
        if self.loaded.read().contains_key(name) {
            if let Err(e) = self.unload(name).await {
                return PluginLoadResult::failed(name, LoadFailureCategory::InvalidManifest).tap_err(e);
            }
        }
        self.load(manifest, handler, services).await
    }

    pub async fn shutdown_all(&self) {
        let names: Vec<String> = self.loaded.read().keys().cloned().collect();
        for name in names {
            let _ = self.unload(&name).await;
        }
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.read().contains_key(name)
    }

    /// The first loaded handler whose manifest declared `session:
    /// "explicit"`, used by the dispatcher's explicit-session resolution.
    /// Does not disambiguate across groups if more than one such plugin is
    /// loaded.
    pub fn explicit_session_handler(&self) -> Option<Arc<dyn PluginHandler>> {
        self.loaded
            .read()
            .values()
            .find(|p| p.handler.supports_explicit_session())
            .map(|p| p.handler.clone())
    }
}

impl PluginLoadResult {
    fn tap_err(self, e: CoreError) -> Self {
        tracing::warn!(error = %e, "reload's unload step failed; proceeding to reload anyway");
        self
    }
}
