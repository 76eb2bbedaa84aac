//! Shared relay state: storage handle, config and push channels.

use crate::config::Config;
use crate::storage::SqliteStore;
use dashmap::DashMap;
use std::sync::Arc;
use tabvault_types::{DeviceId, PushFrame};
use tokio::sync::mpsc;
use tracing::debug;

/// Per-device push channels backing the SSE event streams.
///
/// A device has at most one live subscription; opening a new stream
/// replaces the previous sender, which closes the older stream's
/// receiver side on the next send attempt.
#[derive(Default)]
pub struct PushChannels {
    senders: DashMap<DeviceId, mpsc::Sender<PushFrame>>,
}

impl PushChannels {
    /// Open a channel for `device`, replacing any existing one.
    pub fn subscribe(&self, device: DeviceId, capacity: usize) -> mpsc::Receiver<PushFrame> {
        let (tx, rx) = mpsc::channel(capacity);
        self.senders.insert(device, tx);
        rx
    }

    /// Drop the channel for `device`. Called when its stream ends.
    pub fn unsubscribe(&self, device: DeviceId) {
        self.senders.remove(&device);
    }

    /// Deliver a frame to `device` if it has a live stream. Push is
    /// best-effort; the catch-up fetch on reconnect covers misses. A
    /// sender whose stream has gone away is pruned so the device counts
    /// as unsubscribed again.
    pub fn notify(&self, device: DeviceId, frame: PushFrame) {
        let closed = match self.senders.get(&device) {
            Some(sender) => match sender.try_send(frame) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(device = %device, "push channel full, frame dropped");
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => true,
            },
            None => false,
        };
        if closed {
            debug!(device = %device, "push channel closed, pruning subscription");
            self.senders.remove(&device);
        }
    }

    /// Number of devices with a live stream.
    pub fn active(&self) -> usize {
        self.senders.len()
    }
}

/// Everything the HTTP handlers share.
pub struct RelayServer {
    config: Config,
    store: Arc<SqliteStore>,
    channels: PushChannels,
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("config", &self.config)
            .field("active_streams", &self.channels.active())
            .finish_non_exhaustive()
    }
}

impl RelayServer {
    /// Create the shared state from a loaded config and an opened store.
    pub fn new(config: Config, store: SqliteStore) -> Self {
        Self {
            config,
            store: Arc::new(store),
            channels: PushChannels::default(),
        }
    }

    /// The relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The storage layer.
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// A storage handle for background tasks.
    pub fn store_arc(&self) -> Arc<SqliteStore> {
        self.store.clone()
    }

    /// The push channel registry.
    pub fn channels(&self) -> &PushChannels {
        &self.channels
    }
}

/// Seconds since the Unix epoch.
pub fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabvault_types::{PendingRestore, RequestId, SnapshotId};

    fn frame() -> PushFrame {
        PushFrame::RestorePending {
            request: PendingRestore {
                id: RequestId::new(),
                snapshot_id: SnapshotId::new(),
                snapshot_iv: "bm9uY2U".into(),
                encrypted_blob: "Y2lwaGVydGV4dA".into(),
                created_at: 1_000,
                expires_at: 1_600,
            },
        }
    }

    #[tokio::test]
    async fn notify_reaches_subscribed_device() {
        let channels = PushChannels::default();
        let device = DeviceId::random();
        let mut rx = channels.subscribe(device, 4);

        channels.notify(device, frame());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn notify_without_stream_is_a_no_op() {
        let channels = PushChannels::default();
        channels.notify(DeviceId::random(), frame());
        assert_eq!(channels.active(), 0);
    }

    #[tokio::test]
    async fn resubscribe_replaces_previous_stream() {
        let channels = PushChannels::default();
        let device = DeviceId::random();
        let mut old = channels.subscribe(device, 4);
        let mut new = channels.subscribe(device, 4);

        channels.notify(device, frame());
        assert!(old.try_recv().is_err());
        assert!(new.try_recv().is_ok());
        assert_eq!(channels.active(), 1);
    }

    #[tokio::test]
    async fn notify_prunes_a_dead_stream() {
        let channels = PushChannels::default();
        let device = DeviceId::random();
        let rx = channels.subscribe(device, 4);
        drop(rx);

        channels.notify(device, frame());
        assert_eq!(channels.active(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_drops_the_channel() {
        let channels = PushChannels::default();
        let device = DeviceId::random();
        let _rx = channels.subscribe(device, 4);
        channels.unsubscribe(device);
        assert_eq!(channels.active(), 0);
    }
}
