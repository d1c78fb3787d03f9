use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::Group;
use crate::error::ErrorPayload;

/// `{timestamp, group, source, topic, correlation, stage, outcome, error?}`.
/// Append-only; scoped read-only to the owning group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub group: Group,
    pub source: String,
    pub topic: String,
    pub correlation: Option<Uuid>,
    pub stage: String,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Routed,
    Error,
}

impl AuditEntry {
    fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(audit_entry = %json, "carapace_audit");
    }
}

/// Single-writer append, group-scoped reads. Backed by a bounded in-memory
/// ring plus an optional per-session JSONL sink under
/// `{home}/logs/{group}/{sessionId}.jsonl`, matching the persisted state
/// layout in `SPEC_FULL.md` §6.
pub struct AuditLog {
    ring: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
    logs_root: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            logs_root: None,
        }
    }

    pub fn with_logs_root(mut self, root: PathBuf) -> Self {
        self.logs_root = Some(root);
        self
    }

    /// Append one entry. Also emits via `tracing` and, if a logs root is
    /// configured, appends one JSONL line to that session's log file.
    pub fn append(&self, entry: AuditEntry, session_id: &str) {
        entry.emit();

        if let Some(root) = &self.logs_root {
            if let Err(e) = self.write_jsonl(root, &entry, session_id) {
                tracing::warn!(error = %e, "failed to append audit entry to session log");
            }
        }

        let mut ring = self.ring.lock();
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    fn write_jsonl(&self, root: &PathBuf, entry: &AuditEntry, session_id: &str) -> std::io::Result<()> {
        let dir = root.join(entry.group.as_str());
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{session_id}.jsonl"));
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{line}")
    }

    /// Query the audit log, strictly scoped to one group — intrinsic tools
    /// and plugin `CoreServices` handles must never be able to read another
    /// group's entries.
    pub fn query(&self, group: &Group) -> Vec<AuditEntry> {
        self.ring
            .lock()
            .iter()
            .filter(|e| &e.group == group)
            .cloned()
            .collect()
    }
}
