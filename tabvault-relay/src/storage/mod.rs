//! Storage layer for tabvault-relay.
//!
//! Devices, encrypted snapshots, restore requests and the account key
//! envelopes. Everything content-bearing is opaque ciphertext; the relay
//! stores routing metadata only.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::StorageError;
use async_trait::async_trait;
use tabvault_types::{
    DeviceId, KeyEnvelopeUpload, PasswordEnvelope, RecoveryEnvelope, RequestId, RestoreRequest,
    RestoreStatus, SnapshotId,
};

/// A registered device.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    /// Device identity.
    pub device_id: DeviceId,
    /// Human-readable name.
    pub device_name: String,
    /// Optional platform fingerprint for re-adoption.
    pub platform_fingerprint: Option<String>,
    /// Unix timestamp of registration.
    pub created_at: i64,
    /// Unix timestamp of last heartbeat or upload.
    pub last_seen: i64,
}

/// A stored encrypted snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    /// Snapshot id.
    pub snapshot_id: SnapshotId,
    /// Device that uploaded it.
    pub device_id: DeviceId,
    /// Capture timestamp claimed by the device.
    pub captured_at: i64,
    /// Encryption nonce, base64.
    pub iv: String,
    /// Ciphertext, base64.
    pub encrypted_blob: String,
}

/// Result of registering a device.
#[derive(Debug, Clone)]
pub struct RegistrationOutcome {
    /// The effective device record (may be a re-adopted earlier one).
    pub device: DeviceRecord,
    /// Whether an existing row was re-adopted via platform fingerprint.
    pub adopted: bool,
}

/// Result of a completion attempt on a restore request.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    /// The request's status after the attempt.
    pub status: RestoreStatus,
    /// True when the request was already terminal and nothing changed.
    pub already_resolved: bool,
}

/// Counts from one cleanup pass.
#[derive(Debug, Clone, Default)]
pub struct CleanupStats {
    /// Pending restore requests lapsed to `expired`.
    pub restores_lapsed: u64,
    /// Snapshots deleted by retention.
    pub snapshots_deleted: u64,
}

/// Trait for relay storage backends.
#[async_trait]
pub trait RelayStore: Send + Sync {
    /// Register a device, re-adopting an existing row when the platform
    /// fingerprint matches a known device.
    async fn register_device(
        &self,
        device_id: DeviceId,
        device_name: &str,
        platform_fingerprint: Option<&str>,
        now: i64,
    ) -> Result<RegistrationOutcome, StorageError>;

    /// Update a device's last-seen time. Returns false if unknown.
    async fn touch_device(&self, device_id: DeviceId, now: i64) -> Result<bool, StorageError>;

    /// Look up a device.
    async fn get_device(&self, device_id: DeviceId) -> Result<Option<DeviceRecord>, StorageError>;

    /// Delete a device and its snapshots. Pending restores naming it as
    /// source or target lapse.
    async fn delete_device(&self, device_id: DeviceId) -> Result<(), StorageError>;

    /// Store an encrypted snapshot.
    async fn insert_snapshot(&self, record: SnapshotRecord) -> Result<(), StorageError>;

    /// The newest snapshot of every device that has one, newest capture
    /// first. Ties on `captured_at` break toward the most recently
    /// inserted row.
    async fn latest_per_device(
        &self,
    ) -> Result<Vec<(SnapshotRecord, DeviceRecord)>, StorageError>;

    /// One device's newest snapshot.
    async fn latest_for_device(
        &self,
        device: DeviceId,
    ) -> Result<Option<(SnapshotRecord, DeviceRecord)>, StorageError>;

    /// Look up a snapshot by id.
    async fn get_snapshot(
        &self,
        snapshot_id: SnapshotId,
    ) -> Result<Option<SnapshotRecord>, StorageError>;

    /// Create a restore request, atomically lapsing any still-pending
    /// request for the same target.
    async fn create_restore(&self, request: RestoreRequest) -> Result<(), StorageError>;

    /// The single actionable pending request for a target, newest first.
    async fn pending_restore(
        &self,
        target: DeviceId,
        now: i64,
    ) -> Result<Option<RestoreRequest>, StorageError>;

    /// Resolve a restore request to a terminal status.
    ///
    /// Exactly one caller wins; every later attempt observes
    /// `already_resolved`. A request past its expiry resolves to
    /// `expired` regardless of the reported outcome. Returns `None` for
    /// an unknown request id.
    async fn complete_restore(
        &self,
        request: RequestId,
        outcome: RestoreStatus,
        error_msg: Option<&str>,
        now: i64,
    ) -> Result<Option<CompletionOutcome>, StorageError>;

    /// Look up a restore request.
    async fn get_restore(
        &self,
        request: RequestId,
    ) -> Result<Option<RestoreRequest>, StorageError>;

    /// Store or partially replace the account key envelopes. A missing
    /// recovery envelope in the upload keeps the stored one.
    async fn put_keys(&self, upload: &KeyEnvelopeUpload) -> Result<(), StorageError>;

    /// The stored password envelope.
    async fn get_password_envelope(&self) -> Result<Option<PasswordEnvelope>, StorageError>;

    /// The stored recovery verifier salt (base64).
    async fn get_recovery_salt(&self) -> Result<Option<String>, StorageError>;

    /// The recovery envelope together with its stored verifier hash.
    /// The handler compares the verifier before releasing the envelope.
    async fn get_recovery(
        &self,
    ) -> Result<Option<(RecoveryEnvelope, String)>, StorageError>;

    /// Lapse overdue pending restores and apply snapshot retention.
    async fn cleanup(&self, now: i64, retention_secs: u64) -> Result<CleanupStats, StorageError>;
}
