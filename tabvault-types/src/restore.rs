//! Restore-request lifecycle types.

use crate::{DeviceId, RequestId, SnapshotId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a restore request.
///
/// `Pending` is the only non-terminal state. A request leaves `Pending`
/// exactly once; the terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    /// Waiting for the target device to act (or for expiry).
    Pending,
    /// The target device reopened the snapshot.
    Completed,
    /// The target device tried and failed (carries a reason on the request).
    Failed,
    /// The request lapsed without being consumed.
    Expired,
}

impl RestoreStatus {
    /// Whether this status is terminal (no further transitions).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RestoreStatus::Pending)
    }

    /// The stable string form used on the wire and in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreStatus::Pending => "pending",
            RestoreStatus::Completed => "completed",
            RestoreStatus::Failed => "failed",
            RestoreStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for RestoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a [`RestoreStatus`] from its string form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown restore status: {0}")]
pub struct StatusParseError(pub String);

impl FromStr for RestoreStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RestoreStatus::Pending),
            "completed" => Ok(RestoreStatus::Completed),
            "failed" => Ok(RestoreStatus::Failed),
            "expired" => Ok(RestoreStatus::Expired),
            other => Err(StatusParseError(other.to_string())),
        }
    }
}

/// A restore request as the relay records it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    /// Unique request identifier.
    pub id: RequestId,
    /// Device that asked for the restore.
    pub source_device: DeviceId,
    /// Device that should reopen the snapshot.
    pub target_device: DeviceId,
    /// The snapshot to reopen (resolved at creation time).
    pub snapshot_id: SnapshotId,
    /// Current lifecycle status.
    pub status: RestoreStatus,
    /// Short human-readable reason when `status == Failed`.
    pub error: Option<String>,
    /// Unix timestamp (seconds) the request was created.
    pub created_at: i64,
    /// Unix timestamp (seconds) after which the request is no longer actionable.
    ///
    /// Fixed at creation; independent of any liveness signal.
    pub expires_at: i64,
}

impl RestoreRequest {
    /// Whether the request can still be acted on at `now`.
    ///
    /// Expiry is evaluated here as a query-time predicate, in addition to
    /// the background sweep that eventually writes `status = expired`.
    pub fn is_actionable(&self, now: i64) -> bool {
        self.status == RestoreStatus::Pending && self.expires_at > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(status: RestoreStatus, expires_at: i64) -> RestoreRequest {
        RestoreRequest {
            id: RequestId::new(),
            source_device: DeviceId::random(),
            target_device: DeviceId::random(),
            snapshot_id: SnapshotId::new(),
            status,
            error: None,
            created_at: 1_000,
            expires_at,
        }
    }

    #[test]
    fn pending_is_not_terminal() {
        assert!(!RestoreStatus::Pending.is_terminal());
        assert!(RestoreStatus::Completed.is_terminal());
        assert!(RestoreStatus::Failed.is_terminal());
        assert!(RestoreStatus::Expired.is_terminal());
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [
            RestoreStatus::Pending,
            RestoreStatus::Completed,
            RestoreStatus::Failed,
            RestoreStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<RestoreStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_string_fails() {
        assert!("cancelled".parse::<RestoreStatus>().is_err());
    }

    #[test]
    fn status_serde_uses_snake_case() {
        let json = serde_json::to_string(&RestoreStatus::Pending).unwrap();
        assert_eq!(json, "\"pending\"");
    }

    #[test]
    fn actionable_requires_pending_and_unexpired() {
        let now = 2_000;
        assert!(request(RestoreStatus::Pending, now + 60).is_actionable(now));
        assert!(!request(RestoreStatus::Pending, now - 1).is_actionable(now));
        assert!(!request(RestoreStatus::Completed, now + 60).is_actionable(now));
    }

    #[test]
    fn expiry_boundary_is_exclusive() {
        // A request whose expires_at equals now has already lapsed.
        let now = 5_000;
        assert!(!request(RestoreStatus::Pending, now).is_actionable(now));
    }
}
