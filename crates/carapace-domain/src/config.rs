use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::SessionPolicy;

/// Immutable after supervisor start. Loaded once from TOML; changes require
/// a restart (per `SPEC_FULL.md` §5, "no global mutable configuration").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The supervisor's home directory, per `SPEC_FULL.md` §6's persisted
    /// state layout: `{home}/pid`, `{home}/logs/...`, `{home}/credentials/...`.
    #[serde(default = "default_home")]
    pub home: String,
    #[serde(default)]
    pub router: RouterLimits,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub plugin_host: PluginHostConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub containers: ContainerConfig,
}

fn default_home() -> String {
    "~/.carapace".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home: default_home(),
            router: RouterLimits::default(),
            rate_limit: RateLimitConfig::default(),
            plugin_host: PluginHostConfig::default(),
            sessions: SessionConfig::default(),
            dispatcher: DispatcherConfig::default(),
            containers: ContainerConfig::default(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Non-fatal structural checks run at startup; fed to `doctor`. Unlike
    /// deserialization errors these never prevent boot — only warn.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        if self.router.max_field_bytes > self.router.max_payload_bytes {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "router.max_field_bytes".into(),
                message: "max_field_bytes exceeds max_payload_bytes; field limit is unreachable".into(),
            });
        }
        if self.rate_limit.burst_size == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "rate_limit.burst_size".into(),
                message: "burst_size of 0 would reject every request".into(),
            });
        }
        errors
    }
}

/// Router pipeline stage 1: size & shape limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterLimits {
    pub max_raw_bytes: usize,
    pub max_payload_bytes: usize,
    pub max_field_bytes: usize,
    pub max_json_depth: usize,
    pub handler_timeout: Duration,
    pub plugin_init_timeout: Duration,
}

impl Default for RouterLimits {
    fn default() -> Self {
        Self {
            max_raw_bytes: 1024 * 1024,
            max_payload_bytes: 256 * 1024,
            max_field_bytes: 100 * 1024,
            max_json_depth: 64,
            handler_timeout: Duration::from_secs(30),
            plugin_init_timeout: Duration::from_secs(10),
        }
    }
}

/// Router pipeline stage 6: token bucket per `(group, tool)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginHostConfig {
    pub built_in_dir: String,
    pub user_dir: String,
    pub credentials_root: String,
    pub init_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for PluginHostConfig {
    fn default() -> Self {
        Self {
            built_in_dir: "/usr/lib/carapace/plugins".into(),
            user_dir: "~/.carapace/plugins".into(),
            credentials_root: "~/.carapace/credentials".into(),
            init_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_sessions_per_group: usize,
    pub claude_session_ttl: Duration,
    pub stop_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_group: 4,
            claude_session_ttl: Duration::from_secs(60 * 60),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub configured_groups: HashSet<String>,
    /// Per-group session policy (`fresh`/`resume`/`explicit`). A group with
    /// no entry here defaults to `fresh`, per `SPEC_FULL.md` §4.5.
    pub group_policies: HashMap<String, SessionPolicy>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            configured_groups: HashSet::new(),
            group_policies: HashMap::new(),
        }
    }
}

impl DispatcherConfig {
    pub fn policy_for(&self, group: &str) -> SessionPolicy {
        self.group_policies.get(group).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Ordered list of runtime names to probe at startup; first available
    /// wins (e.g. `["docker", "podman", "apple"]`).
    pub runtimes: Vec<String>,
    pub image_tag: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtimes: vec!["docker".into(), "podman".into()],
            image_tag: "carapace/agent:latest".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {}: {}", self.severity, self.field, self.message)
    }
}
