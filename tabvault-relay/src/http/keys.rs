//! Key envelope storage and recovery unlock.
//!
//! The relay never sees a usable key. It stores password- and
//! recovery-wrapped ciphertext and a salted verifier hash; releasing
//! the recovery envelope requires presenting the matching verifier.

use super::auth::RequireAuth;
use super::constant_time_eq;
use crate::error::{ApiError, ApiResult};
use crate::server::RelayServer;
use crate::storage::RelayStore;
use axum::http::StatusCode;
use axum::{Extension, Json};
use std::sync::Arc;
use tabvault_types::{
    KeyEnvelopeUpload, PasswordEnvelope, RecoveryEnvelope, RecoverySalt, RecoveryUnlock,
};
use tracing::{info, warn};

/// PUT /v1/keys
pub async fn put_handler(
    Extension(server): Extension<Arc<RelayServer>>,
    _auth: RequireAuth,
    Json(req): Json<KeyEnvelopeUpload>,
) -> ApiResult<StatusCode> {
    if req.recovery.is_some() != req.recovery_hash.is_some()
        || req.recovery.is_some() != req.recovery_hash_salt.is_some()
    {
        return Err(ApiError::BadRequest(
            "recovery envelope and verifier must be uploaded together".into(),
        ));
    }

    server.store().put_keys(&req).await?;
    info!(
        rotated_recovery = req.recovery.is_some(),
        "key envelopes stored"
    );
    Ok(StatusCode::NO_CONTENT)
}

/// GET /v1/keys
pub async fn get_password_handler(
    Extension(server): Extension<Arc<RelayServer>>,
    _auth: RequireAuth,
) -> ApiResult<Json<PasswordEnvelope>> {
    let envelope = server
        .store()
        .get_password_envelope()
        .await?
        .ok_or_else(|| ApiError::NotFound("no key envelope stored".into()))?;
    Ok(Json(envelope))
}

/// GET /v1/keys/recovery
pub async fn recovery_salt_handler(
    Extension(server): Extension<Arc<RelayServer>>,
    _auth: RequireAuth,
) -> ApiResult<Json<RecoverySalt>> {
    let salt = server
        .store()
        .get_recovery_salt()
        .await?
        .ok_or_else(|| ApiError::NotFound("no recovery envelope stored".into()))?;
    Ok(Json(RecoverySalt {
        recovery_hash_salt: salt,
    }))
}

/// POST /v1/keys/recovery
pub async fn recovery_unlock_handler(
    Extension(server): Extension<Arc<RelayServer>>,
    _auth: RequireAuth,
    Json(req): Json<RecoveryUnlock>,
) -> ApiResult<Json<RecoveryEnvelope>> {
    let (envelope, stored_hash) = server
        .store()
        .get_recovery()
        .await?
        .ok_or_else(|| ApiError::NotFound("no recovery envelope stored".into()))?;

    if !constant_time_eq(req.recovery_hash.as_bytes(), stored_hash.as_bytes()) {
        warn!("recovery unlock rejected, verifier mismatch");
        return Err(ApiError::Unauthorized);
    }

    info!("recovery envelope released");
    Ok(Json(envelope))
}
