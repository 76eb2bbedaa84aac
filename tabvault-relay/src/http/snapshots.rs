//! Encrypted snapshot upload and retrieval.
//!
//! Snapshot content is opaque ciphertext; the relay enforces only a
//! size cap and routing metadata.

use super::auth::RequireAuth;
use crate::error::{ApiError, ApiResult};
use crate::server::{current_timestamp, RelayServer};
use crate::storage::{RelayStore, SnapshotRecord};
use axum::extract::Query;
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;
use tabvault_types::{DeviceId, LatestSnapshotRow, SnapshotId, SnapshotUpload, SnapshotUploadAck};
use tracing::debug;

/// Query parameters for the latest-snapshot lookup.
#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    /// Restrict to one device's snapshots.
    pub device_id: Option<DeviceId>,
}

/// POST /v1/snapshots
pub async fn upload_handler(
    Extension(server): Extension<Arc<RelayServer>>,
    _auth: RequireAuth,
    Json(req): Json<SnapshotUpload>,
) -> ApiResult<Json<SnapshotUploadAck>> {
    let limit = server.config().storage.max_snapshot_size;
    if req.encrypted_blob.len() > limit {
        return Err(ApiError::PayloadTooLarge {
            size: req.encrypted_blob.len(),
            limit,
        });
    }

    let now = current_timestamp();
    if !server.store().touch_device(req.device_id, now).await? {
        return Err(ApiError::Rejected("unknown device".into()));
    }

    let record = SnapshotRecord {
        snapshot_id: SnapshotId::new(),
        device_id: req.device_id,
        captured_at: req.captured_at,
        iv: req.iv,
        encrypted_blob: req.encrypted_blob,
    };
    let ack = SnapshotUploadAck {
        snapshot_id: record.snapshot_id,
        captured_at: record.captured_at,
    };
    server.store().insert_snapshot(record).await?;

    debug!(device = %req.device_id, snapshot = %ack.snapshot_id, "snapshot stored");
    Ok(Json(ack))
}

/// GET /v1/snapshots/latest
///
/// One row per device that has uploaded, newest capture first. With a
/// `device_id` filter the list has zero or one rows.
pub async fn latest_handler(
    Extension(server): Extension<Arc<RelayServer>>,
    _auth: RequireAuth,
    Query(query): Query<LatestQuery>,
) -> ApiResult<Json<Vec<LatestSnapshotRow>>> {
    let found = match query.device_id {
        Some(device) => server
            .store()
            .latest_for_device(device)
            .await?
            .into_iter()
            .collect(),
        None => server.store().latest_per_device().await?,
    };

    let rows = found
        .into_iter()
        .map(|(snapshot, device)| LatestSnapshotRow {
            snapshot_id: snapshot.snapshot_id,
            device_id: snapshot.device_id,
            captured_at: snapshot.captured_at,
            iv: snapshot.iv,
            encrypted_blob: snapshot.encrypted_blob,
            device_name: device.device_name,
            last_seen: device.last_seen,
        })
        .collect();

    Ok(Json(rows))
}
