use serde::{Deserialize, Serialize};

/// How much trust a tool invocation requires before the router will dispatch
/// it. `High` tools require a prior out-of-band approval (see the
/// confirmation gate, router pipeline stage 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// A single entry in the tool catalog. `arguments_schema` is a restricted
/// JSON Schema draft-07 subset and must have `additionalProperties: false`
/// at every object level — enforced at manifest-validation time, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub risk_level: RiskLevel,
    pub arguments_schema: serde_json::Value,
}

impl ToolDeclaration {
    /// The wire topic this tool is invoked on, per router pipeline stage 3.
    pub fn topic(&self) -> String {
        format!("tool.invoke.{}", self.name)
    }
}

/// Plugin- and tool-names that may never be registered by a user plugin.
pub const RESERVED_TOOL_NAMES: &[&str] = &["get_diagnostics", "list_tools", "get_session_info"];

pub fn is_reserved_tool_name(name: &str) -> bool {
    RESERVED_TOOL_NAMES.contains(&name)
}
