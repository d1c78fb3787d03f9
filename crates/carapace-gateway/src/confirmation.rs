//! Router pipeline stage 7: the confirmation gate for `risk_level: "high"`
//! tools.
//!
//! Unlike the teacher's `runtime/approval.rs::ApprovalStore` — which blocks
//! `dispatch_exec` on a `oneshot::Receiver` until a human resolves it or a
//! timeout fires — `spec.md` §4.2 stage 7 requires a synchronous
//! check-and-reject: a request for an unapproved high-risk tool call gets
//! `CONFIRMATION_REQUIRED` immediately, and the caller is expected to drive
//! an out-of-band approval (e.g. through an intrinsic or operator command)
//! and then resend the same request with the same correlation id. This
//! keeps a correlation's approval, once granted, a single-use grant —
//! consumed the first time a matching request is dispatched, so a stale
//! approval can't silently authorize a later, unrelated call that happens
//! to reuse the id space.

use std::collections::HashSet;

use parking_lot::Mutex;
use uuid::Uuid;

/// Set of correlation ids that have been approved out-of-band but not yet
/// consumed by a dispatch.
pub struct ConfirmationGate {
    approved: Mutex<HashSet<Uuid>>,
}

impl ConfirmationGate {
    pub fn new() -> Self {
        Self {
            approved: Mutex::new(HashSet::new()),
        }
    }

    /// Record an out-of-band approval for `correlation`. Idempotent.
    pub fn approve(&self, correlation: Uuid) {
        self.approved.lock().insert(correlation);
    }

    /// Withdraw a previously granted approval before it's consumed, e.g. if
    /// an operator changes their mind. Returns `true` if one was pending.
    pub fn revoke(&self, correlation: Uuid) -> bool {
        self.approved.lock().remove(&correlation)
    }

    /// Check-and-consume: `true` if `correlation` had a pending approval,
    /// which this call removes. A second check for the same correlation
    /// returns `false`.
    pub fn check_and_consume(&self, correlation: Uuid) -> bool {
        self.approved.lock().remove(&correlation)
    }

    pub fn is_pending(&self, correlation: Uuid) -> bool {
        self.approved.lock().contains(&correlation)
    }
}

impl Default for ConfirmationGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unapproved_correlation_is_rejected() {
        let gate = ConfirmationGate::new();
        assert!(!gate.check_and_consume(Uuid::new_v4()));
    }

    #[test]
    fn approved_correlation_passes_once() {
        let gate = ConfirmationGate::new();
        let correlation = Uuid::new_v4();
        gate.approve(correlation);
        assert!(gate.check_and_consume(correlation));
        assert!(!gate.check_and_consume(correlation));
    }

    #[test]
    fn revoke_withdraws_pending_approval() {
        let gate = ConfirmationGate::new();
        let correlation = Uuid::new_v4();
        gate.approve(correlation);
        assert!(gate.revoke(correlation));
        assert!(!gate.check_and_consume(correlation));
    }

    #[test]
    fn approve_is_idempotent() {
        let gate = ConfirmationGate::new();
        let correlation = Uuid::new_v4();
        gate.approve(correlation);
        gate.approve(correlation);
        assert!(gate.is_pending(correlation));
        assert!(gate.check_and_consume(correlation));
    }
}
