//! `ClaudeSessionStore`: records the Claude session id the streaming parser
//! observes for each group, so the dispatcher's `resume` session policy can
//! attach it to the next spawn. Grounded on the teacher's
//! `sa-sessions::store::SessionStore` — `RwLock`-guarded map, fast-path read
//! / slow-path write, JSON-file-backed persistence under the supervisor's
//! home directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use carapace_domain::envelope::Group;
use carapace_domain::session::ClaudeSessionRecord;
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

/// Single-writer append, per-group history. `getLatest` is TTL-bounded;
/// `list` is the unfiltered audit view over the full per-group history.
pub struct ClaudeSessionStore {
    rows: RwLock<HashMap<String, Vec<ClaudeSessionRecord>>>,
    ttl: Duration,
    path: Option<PathBuf>,
}

impl ClaudeSessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            ttl,
            path: None,
        }
    }

    /// Load (or create) the store at `state_path/sessions/claude_sessions.json`,
    /// mirroring `sa-sessions::store::SessionStore::new`'s load-or-create shape.
    pub fn load(state_path: &Path, ttl: Duration) -> std::io::Result<Self> {
        let dir = state_path.join("sessions");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("claude_sessions.json");

        let rows = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        tracing::info!(groups = rows.len(), path = %path.display(), "claude session store loaded");

        Ok(Self {
            rows: RwLock::new(rows),
            ttl,
            path: Some(path),
        })
    }

    /// Append `(group, claude_session_id)` with `last_used_at = now`.
    pub fn save(&self, group: &Group, claude_session_id: Uuid) {
        let record = ClaudeSessionRecord {
            group: group.clone(),
            claude_session_id,
            last_used_at: Utc::now(),
        };
        {
            let mut rows = self.rows.write();
            rows.entry(group.as_str().to_string()).or_default().push(record);
        }
        self.flush();
    }

    /// Most recent record for `group`, or `None` if there isn't one or it's
    /// older than `now - ttl`.
    pub fn get_latest(&self, group: &Group) -> Option<Uuid> {
        let rows = self.rows.read();
        let record = rows.get(group.as_str())?.last()?;
        let now = Utc::now();
        if now - record.last_used_at <= self.ttl {
            Some(record.claude_session_id)
        } else {
            None
        }
    }

    /// Unfiltered audit view of every record ever saved for `group`.
    pub fn list(&self, group: &Group) -> Vec<ClaudeSessionRecord> {
        self.rows.read().get(group.as_str()).cloned().unwrap_or_default()
    }

    /// Flush in-memory state to disk, if backed by a file. A no-op for
    /// in-memory-only stores (e.g. in unit tests built via `new`).
    pub fn flush(&self) {
        let Some(path) = &self.path else { return };
        let rows = self.rows.read();
        if let Ok(json) = serde_json::to_string_pretty(&*rows) {
            if let Err(e) = std::fs::write(path, json) {
                tracing::warn!(error = %e, "failed to persist claude session store");
            }
        }
    }

    /// Release any held resources. Idempotent; a final flush before the
    /// supervisor exits.
    pub fn close(&self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_within_ttl() {
        let store = ClaudeSessionStore::new(Duration::seconds(60));
        let group = Group::from("email");
        let id = Uuid::new_v4();
        store.save(&group, id);
        assert_eq!(store.get_latest(&group), Some(id));
    }

    #[test]
    fn expired_record_returns_none() {
        let store = ClaudeSessionStore::new(Duration::seconds(0));
        let group = Group::from("email");
        store.save(&group, Uuid::new_v4());
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(store.get_latest(&group), None);
    }

    #[test]
    fn list_is_unfiltered_full_history() {
        let store = ClaudeSessionStore::new(Duration::seconds(60));
        let group = Group::from("email");
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        store.save(&group, first);
        store.save(&group, second);
        let history = store.list(&group);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].claude_session_id, second);
    }

    #[test]
    fn unknown_group_has_no_latest() {
        let store = ClaudeSessionStore::new(Duration::seconds(60));
        assert_eq!(store.get_latest(&Group::from("nope")), None);
    }

    #[test]
    fn persists_to_disk_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let group = Group::from("email");
        let id = Uuid::new_v4();
        {
            let store = ClaudeSessionStore::load(dir.path(), Duration::seconds(60)).unwrap();
            store.save(&group, id);
        }
        let reloaded = ClaudeSessionStore::load(dir.path(), Duration::seconds(60)).unwrap();
        assert_eq!(reloaded.get_latest(&group), Some(id));
    }
}
