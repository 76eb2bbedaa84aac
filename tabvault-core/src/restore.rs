//! Restore request lifecycle rules.
//!
//! A restore request starts pending and resolves exactly once into a
//! terminal status. Both the relay and the client enforce the same guard:
//! the relay at the storage layer, the client before acting on a pushed
//! request it may have already handled.

use std::collections::HashSet;
use tabvault_types::{RequestId, RestoreStatus};

/// Rejection of an invalid restore status transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// The request already resolved; terminal states never change.
    #[error("restore request already resolved as {0}")]
    AlreadyResolved(RestoreStatus),
    /// The proposed outcome is not a terminal status.
    #[error("{0} is not a terminal restore status")]
    NotTerminal(RestoreStatus),
}

/// Validate a restore status transition.
///
/// Only `Pending -> {Completed, Failed, Expired}` is allowed. Everything
/// else is rejected, which makes completion idempotent: a retried report
/// against an already-resolved request surfaces as
/// [`TransitionError::AlreadyResolved`] rather than flipping the outcome.
pub fn transition(
    current: RestoreStatus,
    outcome: RestoreStatus,
) -> Result<RestoreStatus, TransitionError> {
    if !outcome.is_terminal() {
        return Err(TransitionError::NotTerminal(outcome));
    }
    if current.is_terminal() {
        return Err(TransitionError::AlreadyResolved(current));
    }
    Ok(outcome)
}

/// Deduplication of pushed restore requests on the target device.
///
/// The push channel delivers at least once: a request can arrive both via
/// the live stream and via the reconnect catch-up fetch. Admitting an id
/// twice must not re-run the restore.
#[derive(Debug, Default)]
pub struct RestoreInbox {
    seen: HashSet<RequestId>,
}

impl RestoreInbox {
    /// Create an empty inbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a request id. Returns `true` the first time an id is seen
    /// and `false` on every later delivery of the same id.
    pub fn admit(&mut self, id: RequestId) -> bool {
        self.seen.insert(id)
    }

    /// Forget a resolved request so the set does not grow unboundedly.
    pub fn forget(&mut self, id: &RequestId) {
        self.seen.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_resolves_to_each_terminal_status() {
        for outcome in [
            RestoreStatus::Completed,
            RestoreStatus::Failed,
            RestoreStatus::Expired,
        ] {
            assert_eq!(transition(RestoreStatus::Pending, outcome), Ok(outcome));
        }
    }

    #[test]
    fn terminal_states_never_change() {
        for current in [
            RestoreStatus::Completed,
            RestoreStatus::Failed,
            RestoreStatus::Expired,
        ] {
            let err = transition(current, RestoreStatus::Completed).unwrap_err();
            assert_eq!(err, TransitionError::AlreadyResolved(current));
        }
    }

    #[test]
    fn pending_is_not_a_valid_outcome() {
        assert_eq!(
            transition(RestoreStatus::Pending, RestoreStatus::Pending),
            Err(TransitionError::NotTerminal(RestoreStatus::Pending))
        );
    }

    #[test]
    fn completed_then_failed_is_rejected() {
        // A late failure report must not overwrite an earlier success.
        assert_eq!(
            transition(RestoreStatus::Completed, RestoreStatus::Failed),
            Err(TransitionError::AlreadyResolved(RestoreStatus::Completed))
        );
    }

    #[test]
    fn inbox_admits_each_id_once() {
        let mut inbox = RestoreInbox::new();
        let id = RequestId::new();

        assert!(inbox.admit(id));
        assert!(!inbox.admit(id));

        let other = RequestId::new();
        assert!(inbox.admit(other));
    }

    #[test]
    fn forgotten_id_can_be_admitted_again() {
        let mut inbox = RestoreInbox::new();
        let id = RequestId::new();
        assert!(inbox.admit(id));
        inbox.forget(&id);
        assert!(inbox.admit(id));
    }
}
