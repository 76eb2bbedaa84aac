//! Device registration and liveness endpoints.

use super::auth::RequireAuth;
use crate::error::{ApiError, ApiResult};
use crate::server::{current_timestamp, RelayServer};
use crate::storage::RelayStore;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::{Extension, Json};
use std::sync::Arc;
use tabvault_types::{DeviceId, RegisterDevice, RegisteredDevice};
use tracing::info;

/// POST /v1/devices
pub async fn register_handler(
    Extension(server): Extension<Arc<RelayServer>>,
    _auth: RequireAuth,
    Json(req): Json<RegisterDevice>,
) -> ApiResult<Json<RegisteredDevice>> {
    let outcome = server
        .store()
        .register_device(
            req.device_id,
            &req.device_name,
            req.platform_fingerprint.as_deref(),
            current_timestamp(),
        )
        .await?;

    info!(
        device = %outcome.device.device_id,
        adopted = outcome.adopted,
        "device registered"
    );
    Ok(Json(RegisteredDevice {
        device_id: outcome.device.device_id,
        device_name: outcome.device.device_name,
    }))
}

/// POST /v1/devices/{id}/heartbeat
pub async fn heartbeat_handler(
    Extension(server): Extension<Arc<RelayServer>>,
    _auth: RequireAuth,
    Path(device): Path<DeviceId>,
) -> ApiResult<StatusCode> {
    let known = server
        .store()
        .touch_device(device, current_timestamp())
        .await?;
    if !known {
        return Err(ApiError::NotFound("unknown device".into()));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /v1/devices/{id}
pub async fn remove_handler(
    Extension(server): Extension<Arc<RelayServer>>,
    _auth: RequireAuth,
    Path(device): Path<DeviceId>,
) -> ApiResult<StatusCode> {
    server.store().delete_device(device).await?;
    server.channels().unsubscribe(device);
    info!(device = %device, "device removed");
    Ok(StatusCode::NO_CONTENT)
}
