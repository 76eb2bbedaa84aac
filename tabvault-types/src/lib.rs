//! # tabvault-types
//!
//! Wire and data types for the TabVault encrypted tab-sync protocol.
//!
//! This crate provides the foundational types used across all TabVault crates:
//! - [`DeviceId`], [`SnapshotId`], [`RequestId`], [`Fingerprint`] - identity and digest types
//! - [`TabRecord`] - the unit of workspace state that gets synced
//! - [`RestoreRequest`], [`RestoreStatus`] - the cross-device restore lifecycle
//! - HTTP request/response DTOs and the [`PushFrame`] event-stream payload

#![warn(missing_docs)]
#![warn(clippy::all)]

mod ids;
mod restore;
mod tabs;
mod wire;

pub use ids::{DeviceId, Fingerprint, RequestId, SnapshotId};
pub use restore::{RestoreRequest, RestoreStatus, StatusParseError};
pub use tabs::TabRecord;
pub use wire::{
    CompleteRestore, CompleteRestoreAck, CreateRestore, KeyEnvelopeUpload, LatestSnapshotRow,
    PasswordEnvelope, PendingRestore, PendingRestoreResponse, PushFrame, RecoveryEnvelope,
    RecoverySalt, RecoveryUnlock, RegisterDevice, RegisteredDevice, RestoreCreated, SnapshotUpload,
    SnapshotUploadAck,
};
