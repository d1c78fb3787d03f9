//! Plugin manifest shape and validation. Generalized from the teacher's
//! skill-manifest validator (`sa-skills::manifest::SkillManifest`) — same
//! hand-written name validator and `ManifestValidation{errors, warnings}`
//! result shape, applied to `manifest.json` (plugins) instead of Markdown
//! frontmatter (skills).

use carapace_domain::tool::{is_reserved_tool_name, ToolDeclaration};
use carapace_domain::SessionPolicy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub description: String,
    pub version: String,
    pub app_compat: String,
    pub author: String,
    #[serde(default)]
    pub provides: Provides,
    #[serde(default)]
    pub subscribes: Vec<String>,
    #[serde(default)]
    pub session: Option<SessionPolicy>,
    #[serde(default)]
    pub install: Option<InstallSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provides {
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub tools: Vec<ToolDeclaration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSection {
    #[serde(default)]
    pub credentials: Vec<String>,
}

/// A plugin name must be lowercase alphanumeric segments joined by single
/// hyphens: `^[a-z0-9]+(-[a-z0-9]+)*$`. Written by hand rather than via a
/// regex crate, matching the teacher's own skill-name validator.
pub fn is_valid_plugin_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    let mut prev_was_hyphen = false;
    let mut saw_char_since_hyphen = false;
    for (i, c) in name.chars().enumerate() {
        if c == '-' {
            if i == 0 || prev_was_hyphen || !saw_char_since_hyphen {
                return false;
            }
            prev_was_hyphen = true;
            saw_char_since_hyphen = false;
        } else if c.is_ascii_lowercase() || c.is_ascii_digit() {
            prev_was_hyphen = false;
            saw_char_since_hyphen = true;
        } else {
            return false;
        }
    }
    !prev_was_hyphen
}

#[derive(Debug, Clone, Default)]
pub struct ManifestValidation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ManifestValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl PluginManifest {
    /// Validate the manifest against the fixed manifest schema (structural
    /// checks below) plus the reserved-name / schema-shape rules from
    /// `SPEC_FULL.md` §4.3.
    pub fn validate(&self) -> ManifestValidation {
        let mut result = ManifestValidation::default();

        if !is_valid_plugin_name(&self.name) {
            result.errors.push(format!("invalid plugin name: {}", self.name));
        }
        if self.description.trim().is_empty() {
            result.errors.push("description must not be empty".into());
        }
        if self.version.trim().is_empty() {
            result.errors.push("version must not be empty".into());
        }

        for tool in &self.provides.tools {
            if is_reserved_tool_name(&tool.name) {
                result.errors.push(format!("tool name '{}' is reserved", tool.name));
            }
            if !has_additional_properties_false_everywhere(&tool.arguments_schema) {
                result.errors.push(format!(
                    "tool '{}' schema must set additionalProperties:false at every object level",
                    tool.name
                ));
            }
        }

        if self.provides.tools.is_empty() && self.provides.channels.is_empty() {
            result
                .warnings
                .push("plugin provides neither tools nor channels".into());
        }

        if let Some(install) = &self.install {
            for key in &install.credentials {
                if key.contains('/') || key.contains("..") || key.contains('\0') {
                    result
                        .errors
                        .push(format!("invalid credential key '{key}': must not contain '/', '..', or NUL"));
                }
            }
        }

        result
    }
}

fn has_additional_properties_false_everywhere(schema: &serde_json::Value) -> bool {
    match schema {
        serde_json::Value::Object(map) => {
            if map.get("type").and_then(|t| t.as_str()) == Some("object") {
                if map.get("additionalProperties") != Some(&serde_json::Value::Bool(false)) {
                    return false;
                }
            }
            if let Some(serde_json::Value::Object(props)) = map.get("properties") {
                for (_, sub) in props {
                    if !has_additional_properties_false_everywhere(sub) {
                        return false;
                    }
                }
            }
            true
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carapace_domain::tool::RiskLevel;
    use serde_json::json;

    fn manifest_with_tool(schema: serde_json::Value) -> PluginManifest {
        PluginManifest {
            name: "echo-plugin".into(),
            description: "echoes text".into(),
            version: "0.1.0".into(),
            app_compat: "^1.0".into(),
            author: "test".into(),
            provides: Provides {
                channels: vec![],
                tools: vec![ToolDeclaration {
                    name: "echo".into(),
                    description: "echo".into(),
                    risk_level: RiskLevel::Low,
                    arguments_schema: schema,
                }],
            },
            subscribes: vec![],
            session: None,
            install: None,
        }
    }

    #[test]
    fn valid_name_accepted() {
        assert!(is_valid_plugin_name("echo-plugin"));
        assert!(is_valid_plugin_name("a"));
        assert!(!is_valid_plugin_name("Echo-Plugin"));
        assert!(!is_valid_plugin_name("-echo"));
        assert!(!is_valid_plugin_name("echo-"));
        assert!(!is_valid_plugin_name("echo--plugin"));
        assert!(!is_valid_plugin_name(""));
    }

    #[test]
    fn schema_without_additional_properties_false_is_rejected() {
        let manifest = manifest_with_tool(json!({"type": "object", "properties": {"text": {"type": "string"}}}));
        let validation = manifest.validate();
        assert!(!validation.is_valid());
    }

    #[test]
    fn schema_with_additional_properties_false_is_accepted() {
        let manifest = manifest_with_tool(json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "additionalProperties": false,
        }));
        let validation = manifest.validate();
        assert!(validation.is_valid());
    }

    #[test]
    fn reserved_tool_name_rejected() {
        let mut manifest = manifest_with_tool(json!({"type": "object", "additionalProperties": false}));
        manifest.provides.tools[0].name = "list_tools".into();
        let validation = manifest.validate();
        assert!(!validation.is_valid());
    }

    #[test]
    fn credential_key_with_path_traversal_rejected() {
        let mut manifest = manifest_with_tool(json!({"type": "object", "additionalProperties": false}));
        manifest.install = Some(InstallSection {
            credentials: vec!["../secret".into()],
        });
        let validation = manifest.validate();
        assert!(!validation.is_valid());
    }
}
