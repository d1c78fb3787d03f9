//! The three reserved tools every supervisor registers before any plugin
//! loads: `list_tools`, `get_session_info`, `get_diagnostics`. None of
//! these are plugins in the `PluginHost::load` sense — they have no
//! manifest and never go through the seven-step load sequence — so the
//! supervisor registers them directly in the `ToolCatalog` under the
//! reserved `"core"` plugin name.
//!
//! Grounded on the teacher's built-in-tool registration in
//! `gateway/src/nodes/registry.rs`, where a handful of always-present
//! nodes are registered at startup ahead of any user-discovered ones.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use carapace_domain::envelope::Group;
use carapace_domain::error::CoreError;
use carapace_domain::AuditLog;
use carapace_plugins::host::{CoreServices, InvocationContext, LoadFailureCategory, PluginHandler, PluginLoadResult, SessionLookup};
use carapace_plugins::catalog::ToolCatalog;
use carapace_domain::envelope::EventEnvelope;
use carapace_domain::tool::{RiskLevel, ToolDeclaration};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use uuid::Uuid;

/// Per-(group,tool) health of a loaded or failed plugin, reported by
/// `get_session_info`. Distinct from `LoadFailureCategory`: this is the
/// closed wire taxonomy the intrinsic exposes to callers, not the internal
/// reason the plugin host records at load time.
pub const FAILURE_NETWORK_ERROR: &str = "NETWORK_ERROR";
pub const FAILURE_AUTH_ERROR: &str = "AUTH_ERROR";
pub const FAILURE_CONFIG_ERROR: &str = "CONFIG_ERROR";
pub const FAILURE_INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// Translates a plugin-host load failure into the narrower wire-facing
/// health taxonomy. `PluginHost` has no notion of `AuthError` — no load
/// step distinguishes "bad credentials" from any other init failure — so
/// that wire value is reachable only if a plugin reports it itself through
/// a future richer failure channel; this function documents the
/// simplification rather than hiding it.
pub fn map_failure_category(category: LoadFailureCategory) -> &'static str {
    match category {
        LoadFailureCategory::InvalidManifest | LoadFailureCategory::MissingHandler => FAILURE_CONFIG_ERROR,
        LoadFailureCategory::Timeout => FAILURE_NETWORK_ERROR,
        LoadFailureCategory::InitError => FAILURE_INTERNAL_ERROR,
    }
}

/// Records every `PluginLoadResult` the supervisor's bootstrap observes,
/// since `PluginHost` itself only tracks plugins that are *currently*
/// loaded and has no memory of a plugin that failed to load at all.
pub struct PluginHealthRegistry {
    results: DashMap<String, PluginLoadResult>,
}

impl PluginHealthRegistry {
    pub fn new() -> Self {
        Self { results: DashMap::new() }
    }

    pub fn record(&self, result: PluginLoadResult) {
        self.results.insert(result.plugin.clone(), result);
    }

    /// `{name, healthy, failureCategory?}` for every plugin the bootstrap
    /// has ever attempted to load, in the shape `get_session_info` reports.
    pub fn snapshot(&self) -> Vec<serde_json::Value> {
        self.results
            .iter()
            .map(|entry| {
                let result = entry.value();
                match result.category {
                    None => json!({ "name": result.plugin, "healthy": true }),
                    Some(category) => json!({
                        "name": result.plugin,
                        "healthy": false,
                        "failureCategory": map_failure_category(category),
                    }),
                }
            })
            .collect()
    }
}

impl Default for PluginHealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Looks up when the calling group's current session started, for
/// `get_session_info`. A narrow trait so `carapace-gateway` can hand
/// `carapace-plugins` a view onto `carapace-sessions` without either of
/// those crates depending on each other.
pub trait SessionStartedAt: Send + Sync {
    fn started_at(&self, group: &Group) -> Option<DateTime<Utc>>;
}

fn empty_object_schema() -> serde_json::Value {
    json!({ "type": "object", "additionalProperties": false })
}

pub fn list_tools_declaration() -> ToolDeclaration {
    ToolDeclaration {
        name: "list_tools".into(),
        description: "List every tool currently registered in the catalog.".into(),
        risk_level: RiskLevel::Low,
        arguments_schema: empty_object_schema(),
    }
}

pub fn get_session_info_declaration() -> ToolDeclaration {
    ToolDeclaration {
        name: "get_session_info".into(),
        description: "Report the calling group's session start time and plugin health.".into(),
        risk_level: RiskLevel::Low,
        arguments_schema: empty_object_schema(),
    }
}

pub fn get_diagnostics_declaration() -> ToolDeclaration {
    ToolDeclaration {
        name: "get_diagnostics".into(),
        description: "Query the audit log, scoped to the calling session's group.".into(),
        risk_level: RiskLevel::Low,
        arguments_schema: empty_object_schema(),
    }
}

/// The handler backing all three intrinsic tools. One instance is
/// registered under each of the three names (the catalog keys handlers by
/// tool name, not by plugin identity) so each invocation can switch on
/// `tool` to decide which behavior to run.
pub struct IntrinsicsHandler {
    catalog: Arc<ToolCatalog>,
    audit: Arc<AuditLog>,
    health: Arc<PluginHealthRegistry>,
    session_started_at: Arc<dyn SessionStartedAt>,
}

impl IntrinsicsHandler {
    pub fn new(
        catalog: Arc<ToolCatalog>,
        audit: Arc<AuditLog>,
        health: Arc<PluginHealthRegistry>,
        session_started_at: Arc<dyn SessionStartedAt>,
    ) -> Self {
        Self {
            catalog,
            audit,
            health,
            session_started_at,
        }
    }

    /// Register all three intrinsic tools into `catalog` under the
    /// reserved `"core"` plugin name, bypassing `PluginHost::load` entirely
    /// since intrinsics have no manifest to validate.
    pub fn register_all(self: &Arc<Self>, catalog: &ToolCatalog) -> Result<(), carapace_plugins::catalog::CatalogError> {
        catalog.register("core", list_tools_declaration(), self.clone())?;
        catalog.register("core", get_session_info_declaration(), self.clone())?;
        catalog.register("core", get_diagnostics_declaration(), self.clone())?;
        Ok(())
    }
}

#[async_trait]
impl PluginHandler for IntrinsicsHandler {
    async fn initialize(&self, _services: Arc<CoreServices>) -> Result<(), CoreError> {
        Ok(())
    }

    async fn handle_tool_invocation(&self, tool: &str, _args: serde_json::Value, context: InvocationContext) -> Result<serde_json::Value, CoreError> {
        match tool {
            "list_tools" => {
                let tools: Vec<serde_json::Value> = self
                    .catalog
                    .snapshot()
                    .into_iter()
                    .map(|decl| {
                        json!({
                            "name": decl.name,
                            "description": decl.description,
                            "riskLevel": decl.risk_level,
                        })
                    })
                    .collect();
                Ok(json!({ "tools": tools }))
            }
            "get_session_info" => Ok(json!({
                "group": context.group.as_str(),
                "sessionStartedAt": self.session_started_at.started_at(&context.group),
                "plugins": self.health.snapshot(),
            })),
            "get_diagnostics" => {
                let entries = self.audit.query(&context.group);
                Ok(json!({ "entries": entries }))
            }
            other => Err(CoreError::UnknownTool(other.to_string())),
        }
    }

    async fn shutdown(&self) {}

    async fn handle_event(&self, _envelope: &EventEnvelope) {}

    async fn resolve_session(&self, _envelope: &EventEnvelope, _lookup: &dyn SessionLookup) -> Option<Uuid> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carapace_domain::audit::{AuditEntry, AuditOutcome};

    struct FixedStart(Option<DateTime<Utc>>);
    impl SessionStartedAt for FixedStart {
        fn started_at(&self, _group: &Group) -> Option<DateTime<Utc>> {
            self.0
        }
    }

    fn handler() -> (Arc<IntrinsicsHandler>, Arc<ToolCatalog>, Arc<PluginHealthRegistry>) {
        let catalog = Arc::new(ToolCatalog::new());
        let health = Arc::new(PluginHealthRegistry::new());
        let handler = Arc::new(IntrinsicsHandler::new(
            catalog.clone(),
            Arc::new(AuditLog::new(100)),
            health.clone(),
            Arc::new(FixedStart(None)),
        ));
        (handler, catalog, health)
    }

    fn context() -> InvocationContext {
        InvocationContext {
            group: Group::from("email"),
            session_id: "sess-1".into(),
            correlation_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn register_all_adds_three_reserved_tools() {
        let (handler, catalog, _health) = handler();
        handler.register_all(&catalog).unwrap();
        assert!(catalog.contains("list_tools"));
        assert!(catalog.contains("get_session_info"));
        assert!(catalog.contains("get_diagnostics"));
    }

    #[tokio::test]
    async fn list_tools_reports_registered_tools() {
        let (handler, catalog, _health) = handler();
        handler.register_all(&catalog).unwrap();
        let result = handler.handle_tool_invocation("list_tools", json!({}), context()).await.unwrap();
        assert_eq!(result["tools"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn get_session_info_reports_plugin_health() {
        let (handler, _catalog, health) = handler();
        health.record(PluginLoadResult::ok("echo-plugin"));
        health.record(PluginLoadResult::failed("broken-plugin", LoadFailureCategory::Timeout));

        let result = handler.handle_tool_invocation("get_session_info", json!({}), context()).await.unwrap();
        let plugins = result["plugins"].as_array().unwrap();
        assert_eq!(plugins.len(), 2);
        assert!(plugins.iter().any(|p| p["name"] == "echo-plugin" && p["healthy"] == true));
        assert!(plugins
            .iter()
            .any(|p| p["name"] == "broken-plugin" && p["healthy"] == false && p["failureCategory"] == "NETWORK_ERROR"));
    }

    #[tokio::test]
    async fn get_diagnostics_scoped_to_group() {
        let (handler, _catalog, _health) = handler();
        handler.audit.append(
            AuditEntry {
                timestamp: Utc::now(),
                group: Group::from("email"),
                source: "s1".into(),
                topic: "tool.invoke.echo".into(),
                correlation: None,
                stage: "dispatch".into(),
                outcome: AuditOutcome::Routed,
                error: None,
            },
            "sess-1",
        );
        handler.audit.append(
            AuditEntry {
                timestamp: Utc::now(),
                group: Group::from("other"),
                source: "s2".into(),
                topic: "tool.invoke.echo".into(),
                correlation: None,
                stage: "dispatch".into(),
                outcome: AuditOutcome::Routed,
                error: None,
            },
            "sess-2",
        );

        let result = handler.handle_tool_invocation("get_diagnostics", json!({}), context()).await.unwrap();
        assert_eq!(result["entries"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_intrinsic_tool_errors() {
        let (handler, _catalog, _health) = handler();
        let err = handler.handle_tool_invocation("no_such_tool", json!({}), context()).await.unwrap_err();
        assert!(matches!(err, CoreError::UnknownTool(_)));
    }

    #[test]
    fn map_failure_category_translation() {
        assert_eq!(map_failure_category(LoadFailureCategory::InvalidManifest), FAILURE_CONFIG_ERROR);
        assert_eq!(map_failure_category(LoadFailureCategory::MissingHandler), FAILURE_CONFIG_ERROR);
        assert_eq!(map_failure_category(LoadFailureCategory::Timeout), FAILURE_NETWORK_ERROR);
        assert_eq!(map_failure_category(LoadFailureCategory::InitError), FAILURE_INTERNAL_ERROR);
    }
}
