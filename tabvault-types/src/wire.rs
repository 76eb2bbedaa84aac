//! HTTP request/response DTOs and push-channel frames.
//!
//! Bodies are JSON; binary fields (ciphertext, nonces, salts) travel as
//! base64 text. The relay treats every blob as opaque — these shapes carry
//! routing metadata only.

use crate::{DeviceId, RequestId, RestoreStatus, SnapshotId};
use serde::{Deserialize, Serialize};

/// Register (or re-adopt) a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterDevice {
    /// Locally generated device identity.
    pub device_id: DeviceId,
    /// Human-readable device name.
    pub device_name: String,
    /// Optional derived platform fingerprint. If a device lost its local
    /// identity storage, registering with a matching fingerprint re-adopts
    /// the existing device row instead of creating a new one.
    pub platform_fingerprint: Option<String>,
}

/// Response to device registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredDevice {
    /// The effective device id (may differ from the request when a
    /// fingerprint match re-adopted an earlier identity).
    pub device_id: DeviceId,
    /// The stored device name.
    pub device_name: String,
}

/// Upload one encrypted snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotUpload {
    /// Originating device.
    pub device_id: DeviceId,
    /// Unix timestamp (seconds) the state was captured.
    pub captured_at: i64,
    /// Encryption nonce, base64.
    pub iv: String,
    /// Ciphertext, base64. Size-capped by the relay.
    pub encrypted_blob: String,
}

/// Acknowledgement of a snapshot upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotUploadAck {
    /// Relay-assigned snapshot id.
    pub snapshot_id: SnapshotId,
    /// Echoed capture timestamp.
    pub captured_at: i64,
}

/// One row of the latest-per-device listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestSnapshotRow {
    /// Snapshot id.
    pub snapshot_id: SnapshotId,
    /// Device that uploaded it.
    pub device_id: DeviceId,
    /// Capture timestamp.
    pub captured_at: i64,
    /// Encryption nonce, base64.
    pub iv: String,
    /// Ciphertext, base64.
    pub encrypted_blob: String,
    /// Device display name.
    pub device_name: String,
    /// Unix timestamp of the device's last heartbeat.
    pub last_seen: i64,
}

/// Create a restore request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRestore {
    /// Device making the request.
    pub source_device_id: DeviceId,
    /// Device that should reopen the snapshot.
    pub target_device_id: DeviceId,
    /// Explicit snapshot to reopen; omitted means "latest for the target".
    pub snapshot_id: Option<SnapshotId>,
}

/// Response to restore creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreCreated {
    /// The new request's id.
    pub request_id: RequestId,
    /// Always `pending` on creation.
    pub status: RestoreStatus,
    /// When the request lapses.
    pub expires_at: i64,
}

/// A pending restore request delivered to its target, ciphertext included.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRestore {
    /// Request id — the completion call must echo this.
    pub id: RequestId,
    /// The snapshot to reopen.
    pub snapshot_id: SnapshotId,
    /// The snapshot's encryption nonce, base64.
    pub snapshot_iv: String,
    /// The snapshot's ciphertext, base64.
    pub encrypted_blob: String,
    /// When the request was created.
    pub created_at: i64,
    /// When the request lapses.
    pub expires_at: i64,
}

impl std::fmt::Debug for PendingRestore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRestore")
            .field("id", &self.id)
            .field("snapshot_id", &self.snapshot_id)
            .field(
                "encrypted_blob",
                &format!("[{} base64 chars]", self.encrypted_blob.len()),
            )
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Response to a pending-for-device poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRestoreResponse {
    /// Whether an actionable request exists.
    pub pending: bool,
    /// The request, when `pending` is true.
    pub request: Option<PendingRestore>,
}

/// Report the outcome of a restore attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteRestore {
    /// `completed` or `failed`.
    pub status: RestoreStatus,
    /// Short human-readable reason, required in spirit when `failed`.
    pub error_msg: Option<String>,
}

/// Acknowledgement of a completion report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteRestoreAck {
    /// The request that was (or already had been) resolved.
    pub request_id: RequestId,
    /// The request's status after this call.
    pub status: RestoreStatus,
    /// True when the request was already terminal and this call changed
    /// nothing — the common race between expiry and a slow client.
    #[serde(default)]
    pub already_resolved: bool,
}

/// The password-wrapped key envelope, as served alongside auth responses.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordEnvelope {
    /// Wrapped DataKey ciphertext, base64.
    pub encrypted_master_key: String,
    /// Wrap nonce, base64.
    pub master_key_iv: String,
    /// PBKDF2 salt, base64.
    pub salt: String,
    /// PBKDF2 iteration count used for this envelope.
    pub kdf_iterations: u32,
}

impl std::fmt::Debug for PasswordEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordEnvelope")
            .field("encrypted_master_key", &"[REDACTED]")
            .field("kdf_iterations", &self.kdf_iterations)
            .finish_non_exhaustive()
    }
}

/// The recovery-wrapped key envelope.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryEnvelope {
    /// Wrapped DataKey ciphertext, base64.
    pub recovery_encrypted_master_key: String,
    /// Wrap nonce, base64.
    pub recovery_key_iv: String,
    /// PBKDF2 salt for the recovery-derived wrapping key, base64.
    pub recovery_key_salt: String,
    /// PBKDF2 iteration count used for this envelope.
    pub kdf_iterations: u32,
}

impl std::fmt::Debug for RecoveryEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryEnvelope")
            .field("recovery_encrypted_master_key", &"[REDACTED]")
            .field("kdf_iterations", &self.kdf_iterations)
            .finish_non_exhaustive()
    }
}

/// Store or rotate an account's key envelopes.
///
/// Registration sends both envelopes plus the recovery verifier; a
/// password change resends only the password envelope. The relay stores
/// a salted hash of the recovery code for its own authorization check —
/// the plaintext code itself is never transmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEnvelopeUpload {
    /// The password-wrapped envelope.
    pub password: PasswordEnvelope,
    /// The recovery-wrapped envelope. Present at registration and after
    /// a recovery-code rotation.
    pub recovery: Option<RecoveryEnvelope>,
    /// Salted SHA-256 verifier of the recovery code, hex.
    pub recovery_hash: Option<String>,
    /// Salt for the verifier, base64.
    pub recovery_hash_salt: Option<String>,
}

/// The public salt for the recovery verifier.
///
/// Served without authentication by the code itself: the salt is not a
/// secret, it only prevents precomputed verifier tables across accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySalt {
    /// Salt for the verifier, base64.
    pub recovery_hash_salt: String,
}

/// Request the recovery envelope by proving knowledge of the recovery code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryUnlock {
    /// Salted SHA-256 verifier recomputed client-side, hex.
    pub recovery_hash: String,
}

/// One server-pushed event on a device's channel.
///
/// Heartbeats are SSE comment frames and never reach this enum — only
/// payload-carrying events are framed as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushFrame {
    /// A restore request newly targeting this device.
    RestorePending {
        /// The request and its snapshot ciphertext.
        request: PendingRestore,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> PendingRestore {
        PendingRestore {
            id: RequestId::new(),
            snapshot_id: SnapshotId::new(),
            snapshot_iv: "bm9uY2U".into(),
            encrypted_blob: "Y2lwaGVydGV4dA".into(),
            created_at: 1_705_000_000,
            expires_at: 1_705_000_300,
        }
    }

    #[test]
    fn snapshot_upload_roundtrip() {
        let upload = SnapshotUpload {
            device_id: DeviceId::random(),
            captured_at: 1_705_000_000,
            iv: "aXY".into(),
            encrypted_blob: "YmxvYg".into(),
        };

        let json = serde_json::to_string(&upload).unwrap();
        let restored: SnapshotUpload = serde_json::from_str(&json).unwrap();
        assert_eq!(upload, restored);
    }

    #[test]
    fn create_restore_omits_snapshot() {
        let create = CreateRestore {
            source_device_id: DeviceId::random(),
            target_device_id: DeviceId::random(),
            snapshot_id: None,
        };

        let json = serde_json::to_string(&create).unwrap();
        let restored: CreateRestore = serde_json::from_str(&json).unwrap();
        assert!(restored.snapshot_id.is_none());
    }

    #[test]
    fn pending_response_roundtrip() {
        let response = PendingRestoreResponse {
            pending: true,
            request: Some(pending()),
        };

        let json = serde_json::to_string(&response).unwrap();
        let restored: PendingRestoreResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(response, restored);
    }

    #[test]
    fn push_frame_is_tagged() {
        let frame = PushFrame::RestorePending { request: pending() };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"restore_pending\""));

        let restored: PushFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(frame, restored);
    }

    #[test]
    fn complete_ack_default_flag() {
        // Older relays omit already_resolved; it must default to false.
        let json = format!(
            "{{\"request_id\":\"{}\",\"status\":\"completed\"}}",
            RequestId::new()
        );
        let ack: CompleteRestoreAck = serde_json::from_str(&json).unwrap();
        assert!(!ack.already_resolved);
    }

    #[test]
    fn password_envelope_debug_is_redacted() {
        let envelope = PasswordEnvelope {
            encrypted_master_key: "c2VjcmV0".into(),
            master_key_iv: "aXY".into(),
            salt: "c2FsdA".into(),
            kdf_iterations: 100_000,
        };
        let debug = format!("{:?}", envelope);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("c2VjcmV0"));
    }

    #[test]
    fn pending_restore_debug_hides_blob() {
        let debug = format!("{:?}", pending());
        assert!(!debug.contains("Y2lwaGVydGV4dA"));
    }
}
