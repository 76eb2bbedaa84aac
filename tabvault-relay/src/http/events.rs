//! Server-sent event streams for live push delivery.
//!
//! One stream per device. Payload frames are JSON `data:` events;
//! keep-alives are SSE comments. Catch-up after a gap is the client's
//! job via the pending-restore fetch, so a dropped frame here is never
//! fatal.

use super::auth::RequireAuth;
use crate::error::{ApiError, ApiResult};
use crate::server::RelayServer;
use crate::storage::RelayStore;
use axum::extract::Path;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Extension;
use futures_util::stream::{self, Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tabvault_types::DeviceId;
use tracing::{debug, warn};

/// GET /v1/events/{id}
pub async fn events_handler(
    Extension(server): Extension<Arc<RelayServer>>,
    _auth: RequireAuth,
    Path(device): Path<DeviceId>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    if server.store().get_device(device).await?.is_none() {
        return Err(ApiError::NotFound("unknown device".into()));
    }

    let capacity = server.config().events.channel_capacity;
    let heartbeat = Duration::from_secs(server.config().events.heartbeat_secs);
    let rx = server.channels().subscribe(device, capacity);
    debug!(device = %device, "event stream opened");

    let frames = stream::unfold(rx, |mut rx| async move {
        let frame = rx.recv().await?;
        Some((frame, rx))
    });
    let events = frames.filter_map(|frame| async move {
        match Event::default().json_data(&frame) {
            Ok(event) => Some(Ok::<_, Infallible>(event)),
            Err(e) => {
                warn!(error = %e, "push frame failed to serialize, dropped");
                None
            }
        }
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(heartbeat)))
}
