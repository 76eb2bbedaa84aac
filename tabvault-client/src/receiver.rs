//! Push-channel driver.
//!
//! Interprets the channel state machine against the relay: opens the
//! event stream, hands pushed restore requests to the embedder, and
//! reconnects with backoff when the stream drops. Every successful
//! (re)connect is followed by a pending-requests fetch so nothing pushed
//! during an outage is lost.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use tabvault_core::{ChannelAction, ChannelEvent, ChannelState};
use tabvault_types::{PendingRestore, PushFrame, RestoreStatus, TabRecord};

use crate::client::VaultClient;
use crate::transport::{EventStream, Relay};

/// Opens restored tabs in the local browser, implemented by the embedder.
#[async_trait]
pub trait TabOpener: Send + Sync {
    /// Open the given tabs. An `Err` message marks the restore as failed.
    async fn open_tabs(&self, tabs: Vec<TabRecord>) -> Result<(), String>;
}

/// Run the push loop until `shutdown` flips.
pub async fn run_push_loop<R, O>(
    client: Arc<VaultClient<R>>,
    opener: Arc<O>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: Relay,
    O: TabOpener,
{
    let (mut state, actions) = ChannelState::Idle.on_event(ChannelEvent::ConnectRequested);
    let mut queue: VecDeque<ChannelAction> = actions.into();
    let mut stream: Option<EventStream> = None;

    loop {
        if let Some(action) = queue.pop_front() {
            match action {
                ChannelAction::OpenStream => {
                    let event = match client.open_events().await {
                        Ok(opened) => {
                            debug!("event stream open");
                            stream = Some(opened);
                            ChannelEvent::StreamOpened
                        }
                        Err(e) => ChannelEvent::StreamClosed {
                            reason: e.to_string(),
                        },
                    };
                    feed(&mut state, &mut queue, event);
                }

                ChannelAction::FetchPending => match client.fetch_pending().await {
                    Ok(Some(pending)) => {
                        execute_restore(&client, opener.as_ref(), pending).await;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "pending-restore fetch failed"),
                },

                ChannelAction::DeliverPush(PushFrame::RestorePending { request }) => {
                    execute_restore(&client, opener.as_ref(), request).await;
                }

                ChannelAction::StartRetryTimer { delay } => {
                    debug!(?delay, "event stream down, reconnecting after backoff");
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                        _ = tokio::time::sleep(delay) => {
                            feed(&mut state, &mut queue, ChannelEvent::RetryTimerFired);
                        }
                    }
                }

                ChannelAction::CancelRetryTimer => {}
            }
            continue;
        }

        let Some(open) = stream.as_mut() else {
            // No stream and nothing queued: only a shutdown can move us.
            if shutdown.changed().await.is_err() || *shutdown.borrow() {
                return;
            }
            continue;
        };

        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            frame = open.next() => match frame {
                Some(frame) => feed(&mut state, &mut queue, ChannelEvent::FrameReceived(frame)),
                None => {
                    stream = None;
                    feed(&mut state, &mut queue, ChannelEvent::StreamClosed {
                        reason: "stream ended".into(),
                    });
                }
            }
        }
    }
}

fn feed(state: &mut ChannelState, queue: &mut VecDeque<ChannelAction>, event: ChannelEvent) {
    let (next, actions) = state.clone().on_event(event);
    *state = next;
    queue.extend(actions);
}

async fn execute_restore<R: Relay, O: TabOpener>(
    client: &VaultClient<R>,
    opener: &O,
    pending: PendingRestore,
) {
    let id = pending.id;
    let tabs = match client.handle_pending(pending).await {
        Ok(Some(tabs)) => tabs,
        // Duplicate or lapsed delivery; nothing to do.
        Ok(None) => return,
        Err(e) => {
            warn!(request = %id, error = %e, "restore handling failed");
            return;
        }
    };

    let (status, error) = match opener.open_tabs(tabs).await {
        Ok(()) => (RestoreStatus::Completed, None),
        Err(msg) => {
            warn!(request = %id, error = %msg, "opening restored tabs failed");
            (RestoreStatus::Failed, Some(msg))
        }
    };

    if let Err(e) = client.report_restore(id, status, error).await {
        warn!(request = %id, error = %e, "restore completion report failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SyncOutcome;
    use crate::transport::MockRelay;
    use std::sync::Mutex;
    use tabvault_core::Frame;
    use tabvault_types::{DeviceId, SnapshotId};

    struct RecordingOpener {
        opened: Mutex<Vec<Vec<TabRecord>>>,
        fail_with: Mutex<Option<String>>,
    }

    impl RecordingOpener {
        fn new() -> Self {
            Self {
                opened: Mutex::new(Vec::new()),
                fail_with: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl TabOpener for RecordingOpener {
        async fn open_tabs(&self, tabs: Vec<TabRecord>) -> Result<(), String> {
            if let Some(msg) = self.fail_with.lock().unwrap().take() {
                return Err(msg);
            }
            self.opened.lock().unwrap().push(tabs);
            Ok(())
        }
    }

    fn tab(url: &str) -> TabRecord {
        TabRecord {
            url: url.into(),
            title: url.into(),
            favicon_url: None,
            window_id: 1,
            index: 0,
            active: true,
            pinned: false,
        }
    }

    async fn setup() -> (
        Arc<MockRelay>,
        Arc<VaultClient<MockRelay>>,
        Arc<VaultClient<MockRelay>>,
        SnapshotId,
    ) {
        let relay = Arc::new(MockRelay::new());
        let source = Arc::new(VaultClient::new(
            relay.clone(),
            DeviceId::random(),
            "laptop",
        ));
        source.enroll("pw").await.unwrap();
        let snapshot = match source.sync_pass(&mut [tab("https://work")]).await.unwrap() {
            SyncOutcome::Uploaded { snapshot_id } => snapshot_id,
            other => panic!("expected an upload, got {other:?}"),
        };

        let target = Arc::new(VaultClient::new(
            relay.clone(),
            DeviceId::random(),
            "desktop",
        ));
        target.login("pw").await.unwrap();
        (relay, source, target, snapshot)
    }

    async fn settle() {
        // Let the spawned loop drain its queue.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn catchup_fetch_executes_a_restore_created_while_offline() {
        let (relay, source, target, snapshot) = setup().await;
        // The request exists before the target's loop ever connects.
        let created = source
            .request_restore(target.device_id(), Some(snapshot))
            .await
            .unwrap();

        let opener = Arc::new(RecordingOpener::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_push_loop(target.clone(), opener.clone(), shutdown_rx));
        settle().await;

        assert_eq!(opener.opened.lock().unwrap().len(), 1);
        assert_eq!(opener.opened.lock().unwrap()[0][0].url, "https://work");
        assert_eq!(
            relay.restore(created.request_id).unwrap().status,
            RestoreStatus::Completed
        );
        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn live_push_executes_a_restore() {
        let (relay, source, target, snapshot) = setup().await;
        let opener = Arc::new(RecordingOpener::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_push_loop(target.clone(), opener.clone(), shutdown_rx));
        settle().await;
        assert!(opener.opened.lock().unwrap().is_empty());

        let created = source
            .request_restore(target.device_id(), Some(snapshot))
            .await
            .unwrap();
        let stored = relay.restore(created.request_id).unwrap();
        let pending = target.fetch_pending().await.unwrap().unwrap();
        relay.push(
            target.device_id(),
            Frame::Push(PushFrame::RestorePending { request: pending }),
        );
        settle().await;

        assert_eq!(opener.opened.lock().unwrap().len(), 1);
        assert_eq!(
            relay.restore(stored.id).unwrap().status,
            RestoreStatus::Completed
        );
        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_delivery_completes_only_once() {
        let (relay, source, target, snapshot) = setup().await;
        let opener = Arc::new(RecordingOpener::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_push_loop(target.clone(), opener.clone(), shutdown_rx));
        settle().await;

        let created = source
            .request_restore(target.device_id(), Some(snapshot))
            .await
            .unwrap();
        let pending = target.fetch_pending().await.unwrap().unwrap();
        // The same request arrives twice, as after a reconnect race.
        relay.push(
            target.device_id(),
            Frame::Push(PushFrame::RestorePending {
                request: pending.clone(),
            }),
        );
        relay.push(
            target.device_id(),
            Frame::Push(PushFrame::RestorePending { request: pending }),
        );
        settle().await;

        assert_eq!(opener.opened.lock().unwrap().len(), 1);
        assert_eq!(
            relay.restore(created.request_id).unwrap().status,
            RestoreStatus::Completed
        );
        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn opener_failure_resolves_the_request_as_failed() {
        let (relay, source, target, snapshot) = setup().await;
        let opener = Arc::new(RecordingOpener::new());
        *opener.fail_with.lock().unwrap() = Some("window manager said no".into());

        let created = source
            .request_restore(target.device_id(), Some(snapshot))
            .await
            .unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_push_loop(target.clone(), opener.clone(), shutdown_rx));
        settle().await;

        let resolved = relay.restore(created.request_id).unwrap();
        assert_eq!(resolved.status, RestoreStatus::Failed);
        assert_eq!(resolved.error.as_deref(), Some("window manager said no"));
        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_stream_reconnects_and_catches_up() {
        let (relay, source, target, snapshot) = setup().await;
        let opener = Arc::new(RecordingOpener::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_push_loop(target.clone(), opener.clone(), shutdown_rx));
        settle().await;

        // The stream dies and, while it is down, a restore is created.
        relay.drop_stream(target.device_id());
        let created = source
            .request_restore(target.device_id(), Some(snapshot))
            .await
            .unwrap();

        // Backoff elapses under the paused clock; the reconnect's
        // catch-up fetch finds the request.
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        settle().await;

        assert_eq!(opener.opened.lock().unwrap().len(), 1);
        assert_eq!(
            relay.restore(created.request_id).unwrap().status,
            RestoreStatus::Completed
        );
        shutdown_tx.send(true).unwrap();
    }
}
