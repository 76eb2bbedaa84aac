//! High-level client facade.
//!
//! [`VaultClient`] owns the session key, the sync engine and the restore
//! inbox, and interprets engine actions against a [`Relay`]. The embedder
//! (browser extension shim, CLI) supplies the current tab list and opens
//! restored tabs; everything else happens here.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use thiserror::Error;
use tracing::{debug, info, warn};

use tabvault_core::{EngineAction, EngineEvent, RestoreInbox, SyncEngine, TabEventKind};
use tabvault_types::{
    CompleteRestore, CreateRestore, DeviceId, KeyEnvelopeUpload, LatestSnapshotRow, PendingRestore,
    RecoveryUnlock, RegisterDevice, RequestId, RestoreCreated, RestoreStatus, SnapshotId,
    SnapshotUpload, TabRecord,
};

use crate::codec::{self, CodecError};
use crate::keys::{self, DataKey, KeyError, RecoveryCode, SALT_SIZE};
use crate::transport::{EventStream, Relay, TransportError};

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No unlocked session; call `enroll`, `login` or `recover` first.
    #[error("no active session")]
    NoSession,

    /// Key handling failed.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Snapshot encoding or encryption failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The relay call failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result of one sync pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The fingerprint matched the last upload; nothing was sent.
    Unchanged,
    /// A new snapshot was uploaded.
    Uploaded {
        /// Relay-assigned id of the uploaded snapshot.
        snapshot_id: SnapshotId,
    },
    /// The upload failed; the engine stays dirty and a later timer pass
    /// will retry.
    Failed,
}

/// The TabVault client.
pub struct VaultClient<R: Relay> {
    relay: Arc<R>,
    device_id: DeviceId,
    device_name: String,
    platform_fingerprint: Option<String>,
    engine: Mutex<SyncEngine>,
    inbox: Mutex<RestoreInbox>,
    key: Mutex<Option<DataKey>>,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl<R: Relay> VaultClient<R> {
    /// Create a client for one device.
    pub fn new(relay: Arc<R>, device_id: DeviceId, device_name: impl Into<String>) -> Self {
        Self {
            relay,
            device_id,
            device_name: device_name.into(),
            platform_fingerprint: None,
            engine: Mutex::new(SyncEngine::new()),
            inbox: Mutex::new(RestoreInbox::new()),
            key: Mutex::new(None),
        }
    }

    /// Attach a derived platform fingerprint, letting the relay re-adopt
    /// this device's previous identity after local storage loss.
    pub fn with_platform_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.platform_fingerprint = Some(fingerprint.into());
        self
    }

    /// This device's id.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    fn apply(&self, event: EngineEvent) -> Vec<EngineAction> {
        let mut guard = self.engine.lock().unwrap();
        let (next, actions) = guard.clone().on_event(event);
        *guard = next;
        actions
    }

    fn data_key(&self) -> Result<DataKey, ClientError> {
        self.key
            .lock()
            .unwrap()
            .clone()
            .ok_or(ClientError::NoSession)
    }

    /// First-time account setup on this device.
    ///
    /// Generates the DataKey and recovery code, wraps both, and uploads
    /// the envelopes. Returns the recovery code; this is the only moment
    /// it exists in plaintext, so the caller must show it to the user
    /// immediately.
    pub async fn enroll(&self, password: &str) -> Result<RecoveryCode, ClientError> {
        let key = DataKey::generate();
        let code = RecoveryCode::generate();

        let mut hash_salt = [0u8; SALT_SIZE];
        getrandom::getrandom(&mut hash_salt).expect("getrandom failed");

        let upload = KeyEnvelopeUpload {
            password: keys::wrap_with_password(&key, password)?,
            recovery: Some(keys::wrap_with_recovery(&key, &code)?),
            recovery_hash: Some(code.verifier(&hash_salt)),
            recovery_hash_salt: Some(B64.encode(hash_salt)),
        };
        self.relay.put_keys(upload).await?;
        self.register().await?;

        *self.key.lock().unwrap() = Some(key);
        self.apply(EngineEvent::LoggedIn);
        info!(device = %self.device_id, "account enrolled");
        Ok(code)
    }

    /// Unlock the session with the account password.
    pub async fn login(&self, password: &str) -> Result<(), ClientError> {
        let envelope = self.relay.get_password_envelope().await?;
        let key = keys::open_password_envelope(&envelope, password)?;
        self.register().await?;

        *self.key.lock().unwrap() = Some(key);
        self.apply(EngineEvent::LoggedIn);
        info!(device = %self.device_id, "session unlocked");
        Ok(())
    }

    /// Unlock the session with the recovery code instead of the password.
    pub async fn recover(&self, code: &RecoveryCode) -> Result<(), ClientError> {
        let salt = self.relay.get_recovery_salt().await?;
        let salt_bytes = B64
            .decode(&salt.recovery_hash_salt)
            .map_err(|e| KeyError::MalformedEnvelope(format!("recovery_hash_salt: {e}")))?;

        let envelope = self
            .relay
            .get_recovery_envelope(RecoveryUnlock {
                recovery_hash: code.verifier(&salt_bytes),
            })
            .await?;
        let key = keys::open_recovery_envelope(&envelope, code)?;
        self.register().await?;

        *self.key.lock().unwrap() = Some(key);
        self.apply(EngineEvent::LoggedIn);
        info!(device = %self.device_id, "session unlocked via recovery code");
        Ok(())
    }

    /// End the session and drop key material.
    pub async fn logout(&self) {
        self.apply(EngineEvent::LoggedOut);
        // DataKey zeroizes on drop.
        *self.key.lock().unwrap() = None;
        info!(device = %self.device_id, "session closed");
    }

    /// Set a new password by rewrapping the existing DataKey.
    ///
    /// The DataKey itself never changes, so all stored snapshots and the
    /// recovery envelope remain valid.
    pub async fn change_password(&self, old: &str, new: &str) -> Result<(), ClientError> {
        let envelope = self.relay.get_password_envelope().await?;
        let key = keys::open_password_envelope(&envelope, old)?;

        let upload = KeyEnvelopeUpload {
            password: keys::wrap_with_password(&key, new)?,
            recovery: None,
            recovery_hash: None,
            recovery_hash_salt: None,
        };
        self.relay.put_keys(upload).await?;
        *self.key.lock().unwrap() = Some(key);
        info!("password envelope rotated");
        Ok(())
    }

    /// Issue a fresh recovery code, invalidating the old one.
    pub async fn rotate_recovery(&self, password: &str) -> Result<RecoveryCode, ClientError> {
        let envelope = self.relay.get_password_envelope().await?;
        let key = keys::open_password_envelope(&envelope, password)?;
        let code = RecoveryCode::generate();

        let mut hash_salt = [0u8; SALT_SIZE];
        getrandom::getrandom(&mut hash_salt).expect("getrandom failed");

        let upload = KeyEnvelopeUpload {
            password: keys::wrap_with_password(&key, password)?,
            recovery: Some(keys::wrap_with_recovery(&key, &code)?),
            recovery_hash: Some(code.verifier(&hash_salt)),
            recovery_hash_salt: Some(B64.encode(hash_salt)),
        };
        self.relay.put_keys(upload).await?;
        info!("recovery code rotated");
        Ok(code)
    }

    async fn register(&self) -> Result<(), ClientError> {
        self.relay
            .register_device(RegisterDevice {
                device_id: self.device_id,
                device_name: self.device_name.clone(),
                platform_fingerprint: self.platform_fingerprint.clone(),
            })
            .await?;
        Ok(())
    }

    /// Open the relay push stream for this device.
    pub async fn open_events(&self) -> Result<EventStream, ClientError> {
        Ok(self.relay.open_events(self.device_id).await?)
    }

    /// Report liveness to the relay.
    pub async fn heartbeat(&self) -> Result<(), ClientError> {
        self.relay.heartbeat(self.device_id).await?;
        Ok(())
    }

    /// Feed a platform tab notification.
    ///
    /// Returns `true` when the caller should (re)arm the debounce timer.
    pub fn on_tab_event(&self, kind: TabEventKind) -> bool {
        self.apply(EngineEvent::Tab(kind))
            .iter()
            .any(|a| matches!(a, EngineAction::ArmDebounce { .. }))
    }

    /// Whether the debounce timer firing should trigger a sync pass.
    pub fn on_debounce_fired(&self) -> bool {
        self.apply(EngineEvent::DebounceFired)
            .contains(&EngineAction::CaptureSnapshot)
    }

    /// Whether the fallback tick should trigger a sync pass.
    pub fn on_fallback_tick(&self) -> bool {
        self.apply(EngineEvent::FallbackTick { now: unix_now() })
            .contains(&EngineAction::CaptureSnapshot)
    }

    /// Run one sync pass over the current tab list.
    ///
    /// Encodes and fingerprints the workspace; uploads only when the
    /// fingerprint moved since the last successful upload.
    pub async fn sync_pass(&self, tabs: &mut [TabRecord]) -> Result<SyncOutcome, ClientError> {
        let key = self.data_key()?;
        let encoded = codec::encode_tabs(tabs)?;
        let fingerprint = codec::fingerprint(&encoded);

        let actions = self.apply(EngineEvent::SnapshotCaptured { fingerprint });
        if !actions.contains(&EngineAction::UploadSnapshot) {
            debug!(%fingerprint, "workspace unchanged, skipping upload");
            return Ok(SyncOutcome::Unchanged);
        }

        let sealed = codec::encrypt_snapshot(&key, &encoded)?;
        let captured_at = unix_now();
        let result = self
            .relay
            .upload_snapshot(SnapshotUpload {
                device_id: self.device_id,
                captured_at,
                iv: sealed.iv,
                encrypted_blob: sealed.blob,
            })
            .await;

        match result {
            Ok(ack) => {
                self.apply(EngineEvent::UploadSucceeded {
                    fingerprint,
                    at: ack.captured_at,
                });
                debug!(snapshot = %ack.snapshot_id, "snapshot uploaded");
                Ok(SyncOutcome::Uploaded {
                    snapshot_id: ack.snapshot_id,
                })
            }
            Err(e) => {
                warn!(error = %e, "snapshot upload failed");
                self.apply(EngineEvent::UploadFailed {
                    error: e.to_string(),
                });
                Ok(SyncOutcome::Failed)
            }
        }
    }

    /// Download and decrypt the latest snapshot, optionally pinned to one
    /// device. `None` when the account has no snapshot yet.
    pub async fn download_latest(
        &self,
        device: Option<DeviceId>,
    ) -> Result<Option<Vec<TabRecord>>, ClientError> {
        let key = self.data_key()?;
        let rows = self.relay.latest_snapshots(device).await?;
        let row = match rows.into_iter().max_by_key(|r| r.captured_at) {
            Some(row) => row,
            None => return Ok(None),
        };
        let encoded = codec::decrypt_snapshot(&key, &row.iv, &row.encrypted_blob)?;
        Ok(Some(codec::decode_tabs(&encoded)?))
    }

    /// Each device's latest snapshot row, ciphertext included, for
    /// building a device picker.
    pub async fn latest_overview(&self) -> Result<Vec<LatestSnapshotRow>, ClientError> {
        Ok(self.relay.latest_snapshots(None).await?)
    }

    /// Ask another device to reopen a snapshot.
    pub async fn request_restore(
        &self,
        target: DeviceId,
        snapshot: Option<SnapshotId>,
    ) -> Result<RestoreCreated, ClientError> {
        let created = self
            .relay
            .create_restore(CreateRestore {
                source_device_id: self.device_id,
                target_device_id: target,
                snapshot_id: snapshot,
            })
            .await?;
        info!(request = %created.request_id, target = %target, "restore requested");
        Ok(created)
    }

    /// Poll the state of a restore request this device created.
    pub async fn restore_status(&self, request: RequestId) -> Result<RestoreStatus, ClientError> {
        Ok(self.relay.restore_status(request).await?.status)
    }

    /// Fetch the actionable pending restore for this device, if any.
    pub async fn fetch_pending(&self) -> Result<Option<PendingRestore>, ClientError> {
        let response = self.relay.fetch_pending(self.device_id).await?;
        Ok(response.request)
    }

    /// Handle a restore request addressed to this device.
    ///
    /// Decrypts the snapshot and returns the tab list for the embedder to
    /// open. Returns `None` when the request was already handled (push
    /// delivery is at-least-once) or has lapsed client-side. The embedder
    /// must follow up with [`VaultClient::report_restore`].
    pub async fn handle_pending(
        &self,
        pending: PendingRestore,
    ) -> Result<Option<Vec<TabRecord>>, ClientError> {
        if !self.inbox.lock().unwrap().admit(pending.id) {
            debug!(request = %pending.id, "duplicate restore delivery ignored");
            return Ok(None);
        }
        if pending.expires_at <= unix_now() {
            debug!(request = %pending.id, "restore request lapsed before handling");
            return Ok(None);
        }

        let key = self.data_key()?;
        match codec::decrypt_snapshot(&key, &pending.snapshot_iv, &pending.encrypted_blob)
            .and_then(|encoded| codec::decode_tabs(&encoded))
        {
            Ok(tabs) => Ok(Some(tabs)),
            Err(e) => {
                // The payload is unusable; resolve the request as failed
                // so the source stops waiting.
                warn!(request = %pending.id, error = %e, "restore payload unusable");
                self.report_restore(pending.id, RestoreStatus::Failed, Some(e.to_string()))
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Report the terminal outcome of a restore this device executed.
    ///
    /// Safe to retry: an already-resolved request acks without changing
    /// state.
    pub async fn report_restore(
        &self,
        request: RequestId,
        status: RestoreStatus,
        error: Option<String>,
    ) -> Result<(), ClientError> {
        let ack = self
            .relay
            .complete_restore(
                request,
                CompleteRestore {
                    status,
                    error_msg: error,
                },
            )
            .await?;
        if ack.already_resolved {
            debug!(request = %request, status = %ack.status, "restore was already resolved");
        }
        // The inbox keeps the id so a late duplicate delivery of this
        // request cannot re-run it.
        Ok(())
    }
}
