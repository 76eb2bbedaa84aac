//! HTTP transport against a live relay.
//!
//! Plain JSON over HTTP for the request/response API, plus a text event
//! stream for push. All calls carry the account bearer token; device
//! scoping happens in paths and query parameters.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use std::collections::VecDeque;

use tabvault_core::Frame;
use tabvault_types::{
    CompleteRestore, CompleteRestoreAck, CreateRestore, DeviceId, KeyEnvelopeUpload,
    LatestSnapshotRow, PasswordEnvelope, PendingRestoreResponse, PushFrame, RecoveryEnvelope,
    RecoverySalt, RecoveryUnlock, RegisterDevice, RegisteredDevice, RequestId, RestoreCreated,
    RestoreRequest, SnapshotUpload, SnapshotUploadAck,
};

use super::{EventStream, Relay, TransportError};

/// Relay client over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRelay {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpRelay {
    /// Create a client for the relay at `base_url` using the given
    /// account token.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T, TransportError> {
        let resp = self.check(req).await?;
        resp.json::<T>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn check(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, TransportError> {
        let resp = req
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let message = match resp.text().await {
            Ok(body) => serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
                .unwrap_or(body),
            Err(_) => String::new(),
        };

        Err(match status.as_u16() {
            401 | 403 => TransportError::Unauthorized,
            404 => TransportError::NotFound(message),
            409 | 410 | 422 => TransportError::Rejected(message),
            code => TransportError::Status {
                status: code,
                message,
            },
        })
    }
}

#[async_trait]
impl Relay for HttpRelay {
    async fn register_device(
        &self,
        req: RegisterDevice,
    ) -> Result<RegisteredDevice, TransportError> {
        self.send(self.client.post(self.url("/v1/devices")).json(&req))
            .await
    }

    async fn heartbeat(&self, device: DeviceId) -> Result<(), TransportError> {
        self.check(
            self.client
                .post(self.url(&format!("/v1/devices/{device}/heartbeat"))),
        )
        .await?;
        Ok(())
    }

    async fn remove_device(&self, device: DeviceId) -> Result<(), TransportError> {
        self.check(self.client.delete(self.url(&format!("/v1/devices/{device}"))))
            .await?;
        Ok(())
    }

    async fn upload_snapshot(
        &self,
        req: SnapshotUpload,
    ) -> Result<SnapshotUploadAck, TransportError> {
        self.send(self.client.post(self.url("/v1/snapshots")).json(&req))
            .await
    }

    async fn latest_snapshots(
        &self,
        device: Option<DeviceId>,
    ) -> Result<Vec<LatestSnapshotRow>, TransportError> {
        let mut req = self.client.get(self.url("/v1/snapshots/latest"));
        if let Some(device) = device {
            req = req.query(&[("device_id", device.to_string())]);
        }
        self.send(req).await
    }

    async fn create_restore(&self, req: CreateRestore) -> Result<RestoreCreated, TransportError> {
        self.send(self.client.post(self.url("/v1/restore")).json(&req))
            .await
    }

    async fn fetch_pending(
        &self,
        device: DeviceId,
    ) -> Result<PendingRestoreResponse, TransportError> {
        self.send(
            self.client
                .get(self.url("/v1/restore/pending"))
                .query(&[("device_id", device.to_string())]),
        )
        .await
    }

    async fn complete_restore(
        &self,
        request: RequestId,
        req: CompleteRestore,
    ) -> Result<CompleteRestoreAck, TransportError> {
        self.send(
            self.client
                .post(self.url(&format!("/v1/restore/{request}/complete")))
                .json(&req),
        )
        .await
    }

    async fn restore_status(&self, request: RequestId) -> Result<RestoreRequest, TransportError> {
        self.send(self.client.get(self.url(&format!("/v1/restore/{request}"))))
            .await
    }

    async fn put_keys(&self, req: KeyEnvelopeUpload) -> Result<(), TransportError> {
        self.check(self.client.put(self.url("/v1/keys")).json(&req))
            .await?;
        Ok(())
    }

    async fn get_password_envelope(&self) -> Result<PasswordEnvelope, TransportError> {
        self.send(self.client.get(self.url("/v1/keys"))).await
    }

    async fn get_recovery_salt(&self) -> Result<RecoverySalt, TransportError> {
        self.send(self.client.get(self.url("/v1/keys/recovery")))
            .await
    }

    async fn get_recovery_envelope(
        &self,
        req: RecoveryUnlock,
    ) -> Result<RecoveryEnvelope, TransportError> {
        self.send(self.client.post(self.url("/v1/keys/recovery")).json(&req))
            .await
    }

    async fn open_events(&self, device: DeviceId) -> Result<EventStream, TransportError> {
        let resp = self
            .check(
                self.client
                    .get(self.url(&format!("/v1/events/{device}")))
                    .header("Accept", "text/event-stream"),
            )
            .await?;

        let bytes = resp.bytes_stream();
        let frames = futures_util::stream::unfold(
            (bytes, SseParser::new()),
            |(mut bytes, mut parser)| async move {
                loop {
                    if let Some(frame) = parser.next_frame() {
                        return Some((frame, (bytes, parser)));
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => parser.push(&chunk),
                        Some(Err(_)) | None => return None,
                    }
                }
            },
        );

        Ok(Box::pin(frames))
    }
}

/// Incremental parser for the relay's event stream.
///
/// Events are separated by a blank line. A comment line (leading `:`) is
/// the relay's liveness heartbeat; `data:` lines carry one JSON payload
/// per event.
pub(crate) struct SseParser {
    buffer: Vec<u8>,
    ready: VecDeque<Frame>,
}

impl SseParser {
    pub(crate) fn new() -> Self {
        Self {
            buffer: Vec::new(),
            ready: VecDeque::new(),
        }
    }

    /// Feed raw bytes from the wire.
    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        while let Some(end) = find_event_end(&self.buffer) {
            let event: Vec<u8> = self.buffer.drain(..end).collect();
            // Drop the blank-line separator itself.
            while self.buffer.first() == Some(&b'\n') || self.buffer.first() == Some(&b'\r') {
                self.buffer.remove(0);
            }
            if let Some(frame) = parse_event(&event) {
                self.ready.push_back(frame);
            }
        }
    }

    /// Take the next complete frame, if one has been parsed.
    pub(crate) fn next_frame(&mut self) -> Option<Frame> {
        self.ready.pop_front()
    }
}

fn find_event_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|pos| {
            // Treat \r\n\r\n the same as \n\n.
            let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n");
            match crlf {
                Some(c) if c < pos => c,
                _ => pos,
            }
        })
        .or_else(|| buffer.windows(4).position(|w| w == b"\r\n\r\n"))
}

fn parse_event(event: &[u8]) -> Option<Frame> {
    let text = std::str::from_utf8(event).ok()?;
    let mut data = String::new();
    let mut saw_comment = false;

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.trim_start());
        } else if line.starts_with(':') {
            saw_comment = true;
        }
    }

    if data.is_empty() {
        return saw_comment.then_some(Frame::Heartbeat);
    }

    match serde_json::from_str::<PushFrame>(&data) {
        Ok(payload) => Some(Frame::Push(payload)),
        Err(e) => {
            tracing::warn!(error = %e, "dropping unparseable push frame");
            None
        }
    }
}
