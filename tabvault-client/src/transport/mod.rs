//! Relay transport abstraction.
//!
//! The client talks to the relay through the [`Relay`] trait so the sync
//! and restore logic can be exercised against an in-memory fake. The real
//! implementation is [`HttpRelay`]; tests use [`MockRelay`].

mod http;
mod mock;

pub use http::HttpRelay;
pub use mock::MockRelay;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use tabvault_core::Frame;
use tabvault_types::{
    CompleteRestore, CompleteRestoreAck, CreateRestore, DeviceId, KeyEnvelopeUpload,
    LatestSnapshotRow, PasswordEnvelope, PendingRestoreResponse, RecoveryEnvelope, RecoverySalt,
    RecoveryUnlock, RegisterDevice, RegisteredDevice, RequestId, RestoreCreated, RestoreRequest,
    SnapshotUpload, SnapshotUploadAck,
};

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The relay could not be reached.
    #[error("relay unreachable: {0}")]
    Unreachable(String),

    /// The credentials were rejected.
    #[error("unauthorized")]
    Unauthorized,

    /// The addressed resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request conflicts with relay state (e.g. an unknown target
    /// device for a restore).
    #[error("rejected by relay: {0}")]
    Rejected(String),

    /// The relay answered with an unexpected status.
    #[error("relay error {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Relay-provided message.
        message: String,
    },

    /// A response body could not be decoded.
    #[error("malformed response: {0}")]
    Decode(String),
}

/// The live event stream handed back by [`Relay::open_events`].
pub type EventStream = BoxStream<'static, Frame>;

/// Client-side view of the relay API.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Register this device, or re-adopt an existing registration when
    /// the platform fingerprint matches.
    async fn register_device(
        &self,
        req: RegisterDevice,
    ) -> Result<RegisteredDevice, TransportError>;

    /// Report liveness for the device.
    async fn heartbeat(&self, device: DeviceId) -> Result<(), TransportError>;

    /// Remove the device and everything attached to it.
    async fn remove_device(&self, device: DeviceId) -> Result<(), TransportError>;

    /// Upload an encrypted snapshot.
    async fn upload_snapshot(
        &self,
        req: SnapshotUpload,
    ) -> Result<SnapshotUploadAck, TransportError>;

    /// Fetch each device's latest snapshot, optionally filtered to one
    /// device. Empty when no snapshot exists yet.
    async fn latest_snapshots(
        &self,
        device: Option<DeviceId>,
    ) -> Result<Vec<LatestSnapshotRow>, TransportError>;

    /// Create a restore request targeting another device.
    async fn create_restore(&self, req: CreateRestore) -> Result<RestoreCreated, TransportError>;

    /// Fetch the actionable pending request for this device, if any.
    async fn fetch_pending(
        &self,
        device: DeviceId,
    ) -> Result<PendingRestoreResponse, TransportError>;

    /// Report the terminal outcome of a restore request.
    async fn complete_restore(
        &self,
        request: RequestId,
        req: CompleteRestore,
    ) -> Result<CompleteRestoreAck, TransportError>;

    /// Poll the current state of a restore request.
    async fn restore_status(&self, request: RequestId) -> Result<RestoreRequest, TransportError>;

    /// Store (or replace) the account key envelopes.
    async fn put_keys(&self, req: KeyEnvelopeUpload) -> Result<(), TransportError>;

    /// Fetch the password envelope for this account.
    async fn get_password_envelope(&self) -> Result<PasswordEnvelope, TransportError>;

    /// Fetch the public salt for the recovery verifier.
    async fn get_recovery_salt(&self) -> Result<RecoverySalt, TransportError>;

    /// Fetch the recovery envelope, gated on the salted verifier.
    async fn get_recovery_envelope(
        &self,
        req: RecoveryUnlock,
    ) -> Result<RecoveryEnvelope, TransportError>;

    /// Open the push event stream for this device.
    ///
    /// The stream yields heartbeat and payload frames until the
    /// connection drops; reconnecting is the caller's job.
    async fn open_events(&self, device: DeviceId) -> Result<EventStream, TransportError>;
}
