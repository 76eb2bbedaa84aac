//! HTTP API for tabvault-relay.
//!
//! All `/v1` routes require the configured bearer token; `/health` is
//! open for probes.

pub mod auth;
mod devices;
mod events;
pub mod health;
mod keys;
mod restore;
mod snapshots;

use crate::server::RelayServer;
use axum::routing::{delete, get, post, put};
use axum::{Extension, Router};
use std::sync::Arc;

pub use health::HealthStatus;

/// Byte comparison that does not short-circuit on the first mismatch.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Build the HTTP router with all endpoints.
pub fn build_router(server: Arc<RelayServer>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/v1/devices", post(devices::register_handler))
        .route(
            "/v1/devices/:device/heartbeat",
            post(devices::heartbeat_handler),
        )
        .route("/v1/devices/:device", delete(devices::remove_handler))
        .route("/v1/snapshots", post(snapshots::upload_handler))
        .route("/v1/snapshots/latest", get(snapshots::latest_handler))
        .route("/v1/restore", post(restore::create_handler))
        .route("/v1/restore/pending", get(restore::pending_handler))
        .route(
            "/v1/restore/:request/complete",
            post(restore::complete_handler),
        )
        .route("/v1/restore/:request", get(restore::status_handler))
        .route(
            "/v1/keys",
            put(keys::put_handler).get(keys::get_password_handler),
        )
        .route(
            "/v1/keys/recovery",
            get(keys::recovery_salt_handler).post(keys::recovery_unlock_handler),
        )
        .route("/v1/events/:device", get(events::events_handler))
        .layer(Extension(server))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::SqliteStore;
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use serde::de::DeserializeOwned;
    use serde::Serialize;
    use tabvault_types::{
        CompleteRestore, CompleteRestoreAck, CreateRestore, DeviceId, LatestSnapshotRow,
        PendingRestoreResponse, RegisterDevice, RegisteredDevice, RestoreCreated, RestoreStatus,
        SnapshotUpload, SnapshotUploadAck,
    };
    use tower::util::ServiceExt;

    const TOKEN: &str = "test-token";

    async fn test_server() -> Arc<RelayServer> {
        let store = SqliteStore::in_memory().await.unwrap();
        Arc::new(RelayServer::new(Config::default(), store))
    }

    fn request<T: Serialize>(method: Method, uri: &str, body: Option<&T>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"));
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body<T: DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn register(app: &Router, name: &str) -> DeviceId {
        let req = request(
            Method::POST,
            "/v1/devices",
            Some(&RegisterDevice {
                device_id: DeviceId::random(),
                device_name: name.to_string(),
                platform_fingerprint: None,
            }),
        );
        let response = app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let registered: RegisteredDevice = json_body(response).await;
        registered.device_id
    }

    async fn upload(app: &Router, device: DeviceId, captured_at: i64) -> SnapshotUploadAck {
        let req = request(
            Method::POST,
            "/v1/snapshots",
            Some(&SnapshotUpload {
                device_id: device,
                captured_at,
                iv: "bm9uY2U".into(),
                encrypted_blob: "Y2lwaGVydGV4dA".into(),
            }),
        );
        let response = app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        json_body(response).await
    }

    #[tokio::test]
    async fn health_needs_no_auth() {
        let app = build_router(test_server().await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn api_rejects_missing_token() {
        let app = build_router(test_server().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/v1/snapshots/latest")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn api_rejects_wrong_token() {
        let app = build_router(test_server().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/v1/snapshots/latest")
                    .header(header::AUTHORIZATION, "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn latest_lists_one_row_per_device() {
        let app = build_router(test_server().await);
        let laptop = register(&app, "laptop").await;
        let phone = register(&app, "phone").await;
        upload(&app, laptop, 1_000).await;
        let newest_laptop = upload(&app, laptop, 2_000).await;
        let only_phone = upload(&app, phone, 3_000).await;

        let response = app
            .clone()
            .oneshot(request::<()>(Method::GET, "/v1/snapshots/latest", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let rows: Vec<LatestSnapshotRow> = json_body(response).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].snapshot_id, only_phone.snapshot_id);
        assert_eq!(rows[0].device_name, "phone");
        assert_eq!(rows[1].snapshot_id, newest_laptop.snapshot_id);
        assert_eq!(rows[1].device_name, "laptop");

        let response = app
            .oneshot(request::<()>(
                Method::GET,
                &format!("/v1/snapshots/latest?device_id={laptop}"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let rows: Vec<LatestSnapshotRow> = json_body(response).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].snapshot_id, newest_laptop.snapshot_id);
    }

    #[tokio::test]
    async fn latest_is_empty_before_any_upload() {
        let app = build_router(test_server().await);
        let response = app
            .oneshot(request::<()>(Method::GET, "/v1/snapshots/latest", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let rows: Vec<LatestSnapshotRow> = json_body(response).await;
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn oversized_snapshot_is_rejected() {
        let server = test_server().await;
        let limit = server.config().storage.max_snapshot_size;
        let app = build_router(server);
        let device = register(&app, "laptop").await;

        let req = request(
            Method::POST,
            "/v1/snapshots",
            Some(&SnapshotUpload {
                device_id: device,
                captured_at: 1_000,
                iv: "bm9uY2U".into(),
                encrypted_blob: "A".repeat(limit + 1),
            }),
        );
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn upload_from_unknown_device_is_rejected() {
        let app = build_router(test_server().await);
        let req = request(
            Method::POST,
            "/v1/snapshots",
            Some(&SnapshotUpload {
                device_id: DeviceId::random(),
                captured_at: 1_000,
                iv: "bm9uY2U".into(),
                encrypted_blob: "Y2lwaGVydGV4dA".into(),
            }),
        );
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn restore_round_trip() {
        let app = build_router(test_server().await);
        let source = register(&app, "laptop").await;
        let target = register(&app, "desktop").await;
        let ack = upload(&app, source, 1_000).await;

        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/v1/restore",
                Some(&CreateRestore {
                    source_device_id: source,
                    target_device_id: target,
                    snapshot_id: Some(ack.snapshot_id),
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let created: RestoreCreated = json_body(response).await;
        assert_eq!(created.status, RestoreStatus::Pending);

        let response = app
            .clone()
            .oneshot(request::<()>(
                Method::GET,
                &format!("/v1/restore/pending?device_id={target}"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let pending: PendingRestoreResponse = json_body(response).await;
        assert!(pending.pending);
        let payload = pending.request.unwrap();
        assert_eq!(payload.id, created.request_id);
        assert_eq!(payload.encrypted_blob, "Y2lwaGVydGV4dA");

        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                &format!("/v1/restore/{}/complete", created.request_id),
                Some(&CompleteRestore {
                    status: RestoreStatus::Completed,
                    error_msg: None,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let ack: CompleteRestoreAck = json_body(response).await;
        assert_eq!(ack.status, RestoreStatus::Completed);
        assert!(!ack.already_resolved);

        // A duplicate report acknowledges without changing anything.
        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                &format!("/v1/restore/{}/complete", created.request_id),
                Some(&CompleteRestore {
                    status: RestoreStatus::Failed,
                    error_msg: Some("late".into()),
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let ack: CompleteRestoreAck = json_body(response).await;
        assert_eq!(ack.status, RestoreStatus::Completed);
        assert!(ack.already_resolved);
    }

    #[tokio::test]
    async fn omitted_snapshot_resolves_to_targets_own_latest() {
        let app = build_router(test_server().await);
        let source = register(&app, "laptop").await;
        let target = register(&app, "desktop").await;
        let ack = upload(&app, target, 1_000).await;

        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/v1/restore",
                Some(&CreateRestore {
                    source_device_id: source,
                    target_device_id: target,
                    snapshot_id: None,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(request::<()>(
                Method::GET,
                &format!("/v1/restore/pending?device_id={target}"),
                None,
            ))
            .await
            .unwrap();
        let pending: PendingRestoreResponse = json_body(response).await;
        assert_eq!(pending.request.unwrap().snapshot_id, ack.snapshot_id);
    }

    #[tokio::test]
    async fn omitted_snapshot_with_blank_target_is_rejected() {
        let app = build_router(test_server().await);
        let source = register(&app, "laptop").await;
        let target = register(&app, "desktop").await;
        // The source has uploaded but the target has not.
        upload(&app, source, 1_000).await;

        let response = app
            .oneshot(request(
                Method::POST,
                "/v1/restore",
                Some(&CreateRestore {
                    source_device_id: source,
                    target_device_id: target,
                    snapshot_id: None,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn restore_to_unknown_target_is_rejected() {
        let app = build_router(test_server().await);
        let source = register(&app, "laptop").await;
        upload(&app, source, 1_000).await;

        let response = app
            .oneshot(request(
                Method::POST,
                "/v1/restore",
                Some(&CreateRestore {
                    source_device_id: source,
                    target_device_id: DeviceId::random(),
                    snapshot_id: None,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn nonterminal_completion_is_a_bad_request() {
        let app = build_router(test_server().await);
        let source = register(&app, "laptop").await;
        let target = register(&app, "desktop").await;
        let ack = upload(&app, source, 1_000).await;

        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/v1/restore",
                Some(&CreateRestore {
                    source_device_id: source,
                    target_device_id: target,
                    snapshot_id: Some(ack.snapshot_id),
                }),
            ))
            .await
            .unwrap();
        let created: RestoreCreated = json_body(response).await;

        let response = app
            .oneshot(request(
                Method::POST,
                &format!("/v1/restore/{}/complete", created.request_id),
                Some(&CompleteRestore {
                    status: RestoreStatus::Pending,
                    error_msg: None,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn heartbeat_unknown_device_is_not_found() {
        let app = build_router(test_server().await);
        let response = app
            .oneshot(request::<()>(
                Method::POST,
                &format!("/v1/devices/{}/heartbeat", DeviceId::random()),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
