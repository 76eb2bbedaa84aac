//! In-memory relay for tests.
//!
//! Backs every `Relay` call with a mutex-guarded state table, so client
//! logic can be tested end to end without a network or a database. Push
//! delivery is driven manually through [`MockRelay::push`] and failure
//! injection through [`MockRelay::fail_next`].

use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use tabvault_core::Frame;
use tabvault_types::{
    CompleteRestore, CompleteRestoreAck, CreateRestore, DeviceId, KeyEnvelopeUpload,
    LatestSnapshotRow, PasswordEnvelope, PendingRestore, PendingRestoreResponse, RecoveryEnvelope,
    RecoverySalt, RecoveryUnlock, RegisterDevice, RegisteredDevice, RequestId, RestoreCreated,
    RestoreRequest, RestoreStatus, SnapshotId, SnapshotUpload, SnapshotUploadAck,
};

use super::{EventStream, Relay, TransportError};

/// Lifetime of a pending restore request, in seconds.
const RESTORE_TTL: i64 = 300;

#[derive(Clone)]
struct StoredSnapshot {
    id: SnapshotId,
    device: DeviceId,
    captured_at: i64,
    iv: String,
    blob: String,
    seq: u64,
}

struct State {
    devices: HashMap<DeviceId, String>,
    snapshots: Vec<StoredSnapshot>,
    restores: HashMap<RequestId, RestoreRequest>,
    keys: Option<KeyEnvelopeUpload>,
    streams: HashMap<DeviceId, mpsc::UnboundedSender<Frame>>,
    fail_next: bool,
    seq: u64,
    now: i64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            devices: HashMap::new(),
            snapshots: Vec::new(),
            restores: HashMap::new(),
            keys: None,
            streams: HashMap::new(),
            fail_next: false,
            seq: 0,
            // Clients compare expiry against the wall clock, so the
            // virtual clock starts there and advances from it.
            now: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
        }
    }
}

/// In-memory stand-in for the relay.
#[derive(Clone, Default)]
pub struct MockRelay {
    state: Arc<Mutex<State>>,
}

impl MockRelay {
    /// Create an empty mock relay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call fail with [`TransportError::Unreachable`].
    pub fn fail_next(&self) {
        self.state.lock().unwrap().fail_next = true;
    }

    /// Advance the mock clock.
    pub fn advance_time(&self, seconds: i64) {
        self.state.lock().unwrap().now += seconds;
    }

    /// Current mock time.
    pub fn now(&self) -> i64 {
        self.state.lock().unwrap().now
    }

    /// Deliver a frame to a device's open event stream, if any.
    /// Fire and forget, like the real relay.
    pub fn push(&self, device: DeviceId, frame: Frame) {
        let state = self.state.lock().unwrap();
        if let Some(tx) = state.streams.get(&device) {
            let _ = tx.send(frame);
        }
    }

    /// Drop a device's event stream, simulating a connection loss.
    pub fn drop_stream(&self, device: DeviceId) {
        self.state.lock().unwrap().streams.remove(&device);
    }

    /// Number of snapshots stored.
    pub fn snapshot_count(&self) -> usize {
        self.state.lock().unwrap().snapshots.len()
    }

    /// Look up a stored restore request.
    pub fn restore(&self, id: RequestId) -> Option<RestoreRequest> {
        self.state.lock().unwrap().restores.get(&id).cloned()
    }

    fn take_failure(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next {
            state.fail_next = false;
            return Err(TransportError::Unreachable("injected failure".into()));
        }
        Ok(())
    }
}

fn latest<'a>(
    snapshots: &'a [StoredSnapshot],
    device: Option<DeviceId>,
) -> Option<&'a StoredSnapshot> {
    snapshots
        .iter()
        .filter(|s| device.map_or(true, |d| s.device == d))
        .max_by_key(|s| (s.captured_at, s.seq))
}

#[async_trait]
impl Relay for MockRelay {
    async fn register_device(
        &self,
        req: RegisterDevice,
    ) -> Result<RegisteredDevice, TransportError> {
        self.take_failure()?;
        let mut state = self.state.lock().unwrap();
        state.devices.insert(req.device_id, req.device_name.clone());
        Ok(RegisteredDevice {
            device_id: req.device_id,
            device_name: req.device_name,
        })
    }

    async fn heartbeat(&self, device: DeviceId) -> Result<(), TransportError> {
        self.take_failure()?;
        let state = self.state.lock().unwrap();
        if state.devices.contains_key(&device) {
            Ok(())
        } else {
            Err(TransportError::NotFound("unknown device".into()))
        }
    }

    async fn remove_device(&self, device: DeviceId) -> Result<(), TransportError> {
        self.take_failure()?;
        let mut state = self.state.lock().unwrap();
        state.devices.remove(&device);
        state.snapshots.retain(|s| s.device != device);
        state.streams.remove(&device);
        for r in state.restores.values_mut() {
            let involved = r.source_device == device || r.target_device == device;
            if involved && r.status == RestoreStatus::Pending {
                r.status = RestoreStatus::Expired;
            }
        }
        Ok(())
    }

    async fn upload_snapshot(
        &self,
        req: SnapshotUpload,
    ) -> Result<SnapshotUploadAck, TransportError> {
        self.take_failure()?;
        let mut state = self.state.lock().unwrap();
        let id = SnapshotId::new();
        state.seq += 1;
        let seq = state.seq;
        state.snapshots.push(StoredSnapshot {
            id,
            device: req.device_id,
            captured_at: req.captured_at,
            iv: req.iv,
            blob: req.encrypted_blob,
            seq,
        });
        Ok(SnapshotUploadAck {
            snapshot_id: id,
            captured_at: req.captured_at,
        })
    }

    async fn latest_snapshots(
        &self,
        device: Option<DeviceId>,
    ) -> Result<Vec<LatestSnapshotRow>, TransportError> {
        self.take_failure()?;
        let state = self.state.lock().unwrap();
        let mut rows: Vec<LatestSnapshotRow> = state
            .devices
            .keys()
            .filter(|d| device.map_or(true, |wanted| **d == wanted))
            .filter_map(|d| latest(&state.snapshots, Some(*d)))
            .map(|s| LatestSnapshotRow {
                snapshot_id: s.id,
                device_id: s.device,
                captured_at: s.captured_at,
                iv: s.iv.clone(),
                encrypted_blob: s.blob.clone(),
                device_name: state.devices.get(&s.device).cloned().unwrap_or_default(),
                last_seen: s.captured_at,
            })
            .collect();
        rows.sort_by_key(|r| std::cmp::Reverse(r.captured_at));
        Ok(rows)
    }

    async fn create_restore(&self, req: CreateRestore) -> Result<RestoreCreated, TransportError> {
        self.take_failure()?;
        let mut state = self.state.lock().unwrap();
        if !state.devices.contains_key(&req.target_device_id) {
            return Err(TransportError::Rejected("unknown target device".into()));
        }

        // An omitted snapshot means "the target's own latest", the
        // crash-recovery default. Cross-device restores name the
        // snapshot explicitly.
        let snapshot_id = match req.snapshot_id {
            Some(id) => id,
            None => latest(&state.snapshots, Some(req.target_device_id))
                .map(|s| s.id)
                .ok_or_else(|| {
                    TransportError::Rejected("no snapshot for target device".into())
                })?,
        };

        // A new request supersedes any still-pending one for the same
        // target.
        let now = state.now;
        let target = req.target_device_id;
        for r in state.restores.values_mut() {
            if r.target_device == target && r.status == RestoreStatus::Pending {
                r.status = RestoreStatus::Expired;
            }
        }

        let request = RestoreRequest {
            id: RequestId::new(),
            source_device: req.source_device_id,
            target_device: target,
            snapshot_id,
            status: RestoreStatus::Pending,
            error: None,
            created_at: now,
            expires_at: now + RESTORE_TTL,
        };
        let created = RestoreCreated {
            request_id: request.id,
            status: request.status,
            expires_at: request.expires_at,
        };
        state.restores.insert(request.id, request);
        Ok(created)
    }

    async fn fetch_pending(
        &self,
        device: DeviceId,
    ) -> Result<PendingRestoreResponse, TransportError> {
        self.take_failure()?;
        let state = self.state.lock().unwrap();
        let now = state.now;
        let pending = state
            .restores
            .values()
            .filter(|r| r.target_device == device && r.is_actionable(now))
            .max_by_key(|r| r.created_at);

        let request = match pending {
            Some(r) => {
                let snapshot = state
                    .snapshots
                    .iter()
                    .find(|s| s.id == r.snapshot_id)
                    .ok_or_else(|| TransportError::NotFound("snapshot gone".into()))?;
                Some(PendingRestore {
                    id: r.id,
                    snapshot_id: r.snapshot_id,
                    snapshot_iv: snapshot.iv.clone(),
                    encrypted_blob: snapshot.blob.clone(),
                    created_at: r.created_at,
                    expires_at: r.expires_at,
                })
            }
            None => None,
        };

        Ok(PendingRestoreResponse {
            pending: request.is_some(),
            request,
        })
    }

    async fn complete_restore(
        &self,
        request: RequestId,
        req: CompleteRestore,
    ) -> Result<CompleteRestoreAck, TransportError> {
        self.take_failure()?;
        let mut state = self.state.lock().unwrap();
        let stored = state
            .restores
            .get_mut(&request)
            .ok_or_else(|| TransportError::NotFound("unknown restore request".into()))?;

        match tabvault_core::transition(stored.status, req.status) {
            Ok(next) => {
                stored.status = next;
                stored.error = req.error_msg;
                Ok(CompleteRestoreAck {
                    request_id: request,
                    status: next,
                    already_resolved: false,
                })
            }
            Err(tabvault_core::TransitionError::AlreadyResolved(current)) => {
                Ok(CompleteRestoreAck {
                    request_id: request,
                    status: current,
                    already_resolved: true,
                })
            }
            Err(_) => Err(TransportError::Rejected("invalid status".into())),
        }
    }

    async fn restore_status(&self, request: RequestId) -> Result<RestoreRequest, TransportError> {
        self.take_failure()?;
        self.state
            .lock()
            .unwrap()
            .restores
            .get(&request)
            .cloned()
            .ok_or_else(|| TransportError::NotFound("unknown restore request".into()))
    }

    async fn put_keys(&self, req: KeyEnvelopeUpload) -> Result<(), TransportError> {
        self.take_failure()?;
        self.state.lock().unwrap().keys = Some(req);
        Ok(())
    }

    async fn get_password_envelope(&self) -> Result<PasswordEnvelope, TransportError> {
        self.take_failure()?;
        self.state
            .lock()
            .unwrap()
            .keys
            .as_ref()
            .map(|k| k.password.clone())
            .ok_or_else(|| TransportError::NotFound("no key envelope".into()))
    }

    async fn get_recovery_salt(&self) -> Result<RecoverySalt, TransportError> {
        self.take_failure()?;
        self.state
            .lock()
            .unwrap()
            .keys
            .as_ref()
            .and_then(|k| k.recovery_hash_salt.clone())
            .map(|recovery_hash_salt| RecoverySalt { recovery_hash_salt })
            .ok_or_else(|| TransportError::NotFound("no recovery envelope".into()))
    }

    async fn get_recovery_envelope(
        &self,
        req: RecoveryUnlock,
    ) -> Result<RecoveryEnvelope, TransportError> {
        self.take_failure()?;
        let state = self.state.lock().unwrap();
        let keys = state
            .keys
            .as_ref()
            .ok_or_else(|| TransportError::NotFound("no key envelope".into()))?;

        let stored_hash = keys
            .recovery_hash
            .as_deref()
            .ok_or_else(|| TransportError::NotFound("no recovery envelope".into()))?;
        if stored_hash != req.recovery_hash {
            return Err(TransportError::Unauthorized);
        }
        keys.recovery
            .clone()
            .ok_or_else(|| TransportError::NotFound("no recovery envelope".into()))
    }

    async fn open_events(&self, device: DeviceId) -> Result<EventStream, TransportError> {
        self.take_failure()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().streams.insert(device, tx);

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        });
        Ok(stream.boxed())
    }
}
