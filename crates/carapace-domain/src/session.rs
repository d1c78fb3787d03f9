use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::Group;

/// One container and its lifetime of tool calls. Owned exclusively by the
/// session manager: created on spawn, discarded on cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub group: Group,
    pub container_id: String,
    pub connection_identity: String,
    pub started_at: DateTime<Utc>,
}

/// Written by the streaming parser when it sees a `system` or `result`
/// frame; read by the dispatcher's session policy. TTL-bounded: a read past
/// `now - ttl` is treated as "no record".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeSessionRecord {
    pub group: Group,
    pub claude_session_id: Uuid,
    pub last_used_at: DateTime<Utc>,
}

impl ClaudeSessionRecord {
    pub fn is_within_ttl(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.last_used_at <= ttl
    }
}

/// Governs whether and how a new spawn attaches a prior Claude session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPolicy {
    Fresh,
    Resume,
    Explicit,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        SessionPolicy::Fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_within_ttl() {
        let record = ClaudeSessionRecord {
            group: Group::from("g1"),
            claude_session_id: Uuid::new_v4(),
            last_used_at: Utc::now() - chrono::Duration::seconds(30),
        };
        assert!(record.is_within_ttl(Utc::now(), chrono::Duration::seconds(60)));
        assert!(!record.is_within_ttl(Utc::now(), chrono::Duration::seconds(10)));
    }

    #[test]
    fn default_policy_is_fresh() {
        assert_eq!(SessionPolicy::default(), SessionPolicy::Fresh);
    }
}
