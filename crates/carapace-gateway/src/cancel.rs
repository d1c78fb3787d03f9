//! Per-correlation cancellation for router pipeline stages 4-9.
//!
//! Adapted from the teacher's `runtime/cancel.rs::CancelMap`: that map is
//! keyed by session and cascades a parent turn's cancellation to its
//! registered children. This map inverts the key — each in-flight
//! **correlation id** gets its own `CancellationToken` — and replaces the
//! parent/child group with a session fan-out set, since `spec.md` §4.2's
//! cancellation rule cancels every in-flight call belonging to a session
//! when that session's container exits, not a single call by id.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Tracks one `CancellationToken` per in-flight correlation, plus which
/// correlations belong to which session so a session teardown can cancel
/// all of them at once.
pub struct CancelRegistry {
    tokens: DashMap<Uuid, CancellationToken>,
    by_session: Mutex<HashMap<String, HashSet<Uuid>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self {
            tokens: DashMap::new(),
            by_session: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new in-flight call. Call `finish` once it completes
    /// (successfully, with an error, or because it was cancelled) to avoid
    /// leaking entries.
    pub fn register(&self, session_id: &str, correlation: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.insert(correlation, token.clone());
        self.by_session.lock().entry(session_id.to_owned()).or_default().insert(correlation);
        token
    }

    /// Remove bookkeeping for a completed or cancelled call.
    pub fn finish(&self, session_id: &str, correlation: Uuid) {
        self.tokens.remove(&correlation);
        if let Some(set) = self.by_session.lock().get_mut(session_id) {
            set.remove(&correlation);
        }
    }

    /// Cancel every in-flight call registered under `session_id`, e.g. when
    /// that session's container exits mid-dispatch. Returns the number of
    /// calls signalled.
    pub fn cancel_session(&self, session_id: &str) -> usize {
        let correlations = self.by_session.lock().remove(session_id).unwrap_or_default();
        for correlation in &correlations {
            if let Some(token) = self.tokens.get(correlation) {
                token.cancel();
            }
        }
        correlations.len()
    }

    pub fn is_cancelled(&self, correlation: Uuid) -> bool {
        self.tokens.get(&correlation).map(|t| t.is_cancelled()).unwrap_or(false)
    }
}

impl Default for CancelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_finish_round_trip() {
        let registry = CancelRegistry::new();
        let correlation = Uuid::new_v4();
        let token = registry.register("sess-1", correlation);
        assert!(!token.is_cancelled());
        registry.finish("sess-1", correlation);
        assert!(!registry.is_cancelled(correlation));
    }

    #[test]
    fn cancel_session_cancels_all_its_correlations() {
        let registry = CancelRegistry::new();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        let t1 = registry.register("sess-1", c1);
        let t2 = registry.register("sess-1", c2);

        let cancelled = registry.cancel_session("sess-1");
        assert_eq!(cancelled, 2);
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
    }

    #[test]
    fn cancel_session_does_not_affect_other_sessions() {
        let registry = CancelRegistry::new();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        let t1 = registry.register("sess-1", c1);
        let t2 = registry.register("sess-2", c2);

        registry.cancel_session("sess-1");
        assert!(t1.is_cancelled());
        assert!(!t2.is_cancelled());
    }

    #[test]
    fn cancel_unknown_session_is_a_no_op() {
        let registry = CancelRegistry::new();
        assert_eq!(registry.cancel_session("ghost"), 0);
    }

    #[test]
    fn finish_is_idempotent() {
        let registry = CancelRegistry::new();
        let correlation = Uuid::new_v4();
        registry.register("sess-1", correlation);
        registry.finish("sess-1", correlation);
        registry.finish("sess-1", correlation);
    }
}
