//! Restore-request lifecycle endpoints.

use super::auth::RequireAuth;
use crate::error::{ApiError, ApiResult};
use crate::server::{current_timestamp, RelayServer};
use crate::storage::RelayStore;
use axum::extract::{Path, Query};
use axum::{Extension, Json};
use serde::Deserialize;
use std::sync::Arc;
use tabvault_types::{
    CompleteRestore, CompleteRestoreAck, CreateRestore, DeviceId, PendingRestore,
    PendingRestoreResponse, PushFrame, RequestId, RestoreCreated, RestoreRequest, RestoreStatus,
};
use tracing::info;

/// Query parameters for the pending-restore fetch.
#[derive(Debug, Deserialize)]
pub struct PendingQuery {
    /// The target device asking for its work.
    pub device_id: DeviceId,
}

async fn pending_payload(
    server: &RelayServer,
    request: &RestoreRequest,
) -> ApiResult<PendingRestore> {
    let snapshot = server
        .store()
        .get_snapshot(request.snapshot_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("snapshot no longer stored".into()))?;

    Ok(PendingRestore {
        id: request.id,
        snapshot_id: snapshot.snapshot_id,
        snapshot_iv: snapshot.iv,
        encrypted_blob: snapshot.encrypted_blob,
        created_at: request.created_at,
        expires_at: request.expires_at,
    })
}

/// POST /v1/restore
pub async fn create_handler(
    Extension(server): Extension<Arc<RelayServer>>,
    _auth: RequireAuth,
    Json(req): Json<CreateRestore>,
) -> ApiResult<Json<RestoreCreated>> {
    let now = current_timestamp();

    if server.store().get_device(req.target_device_id).await?.is_none() {
        return Err(ApiError::Rejected("unknown target device".into()));
    }

    // Resolve the snapshot up front so the request always points at
    // concrete ciphertext. An omitted id means the target's own latest,
    // the crash-recovery default; cross-device restores name a snapshot
    // explicitly.
    let snapshot_id = match req.snapshot_id {
        Some(id) => {
            server
                .store()
                .get_snapshot(id)
                .await?
                .ok_or_else(|| ApiError::Rejected("unknown snapshot".into()))?;
            id
        }
        None => server
            .store()
            .latest_for_device(req.target_device_id)
            .await?
            .map(|(snapshot, _)| snapshot.snapshot_id)
            .ok_or_else(|| ApiError::Rejected("no snapshot for target device".into()))?,
    };

    let request = RestoreRequest {
        id: RequestId::new(),
        source_device: req.source_device_id,
        target_device: req.target_device_id,
        snapshot_id,
        status: RestoreStatus::Pending,
        error: None,
        created_at: now,
        expires_at: now + server.config().restore.ttl_secs as i64,
    };
    let created = RestoreCreated {
        request_id: request.id,
        status: request.status,
        expires_at: request.expires_at,
    };
    server.store().create_restore(request.clone()).await?;

    // Best-effort live delivery; the target's catch-up fetch covers a
    // missed push.
    let payload = pending_payload(&server, &request).await?;
    server
        .channels()
        .notify(request.target_device, PushFrame::RestorePending { request: payload });

    info!(
        request = %created.request_id,
        target = %request.target_device,
        "restore requested"
    );
    Ok(Json(created))
}

/// GET /v1/restore/pending
pub async fn pending_handler(
    Extension(server): Extension<Arc<RelayServer>>,
    _auth: RequireAuth,
    Query(query): Query<PendingQuery>,
) -> ApiResult<Json<PendingRestoreResponse>> {
    let found = server
        .store()
        .pending_restore(query.device_id, current_timestamp())
        .await?;

    let response = match found {
        Some(request) => PendingRestoreResponse {
            pending: true,
            request: Some(pending_payload(&server, &request).await?),
        },
        None => PendingRestoreResponse {
            pending: false,
            request: None,
        },
    };
    Ok(Json(response))
}

/// POST /v1/restore/{id}/complete
pub async fn complete_handler(
    Extension(server): Extension<Arc<RelayServer>>,
    _auth: RequireAuth,
    Path(request): Path<RequestId>,
    Json(req): Json<CompleteRestore>,
) -> ApiResult<Json<CompleteRestoreAck>> {
    if !req.status.is_terminal() {
        return Err(ApiError::BadRequest(
            "completion status must be terminal".into(),
        ));
    }

    let outcome = server
        .store()
        .complete_restore(
            request,
            req.status,
            req.error_msg.as_deref(),
            current_timestamp(),
        )
        .await?
        .ok_or_else(|| ApiError::NotFound("unknown restore request".into()))?;

    info!(
        request = %request,
        status = %outcome.status,
        already_resolved = outcome.already_resolved,
        "restore resolved"
    );
    Ok(Json(CompleteRestoreAck {
        request_id: request,
        status: outcome.status,
        already_resolved: outcome.already_resolved,
    }))
}

/// GET /v1/restore/{id}
pub async fn status_handler(
    Extension(server): Extension<Arc<RelayServer>>,
    _auth: RequireAuth,
    Path(request): Path<RequestId>,
) -> ApiResult<Json<RestoreRequest>> {
    let found = server
        .store()
        .get_restore(request)
        .await?
        .ok_or_else(|| ApiError::NotFound("unknown restore request".into()))?;
    Ok(Json(found))
}
