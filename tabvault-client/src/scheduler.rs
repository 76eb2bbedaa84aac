//! Timer driver for the sync engine.
//!
//! Owns the two clocks the engine needs: the coalescing debounce timer
//! and the periodic fallback tick. The engine decides, this module only
//! keeps time and runs sync passes when told to.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use tabvault_core::{TabEventKind, DEBOUNCE_WINDOW, FALLBACK_INTERVAL};
use tabvault_types::TabRecord;

use crate::client::VaultClient;
use crate::transport::Relay;

/// Source of the current tab list, implemented by the embedder.
#[async_trait]
pub trait TabSource: Send + Sync {
    /// Enumerate the currently open tabs.
    async fn current_tabs(&self) -> Vec<TabRecord>;
}

/// Run the sync loop until `shutdown` flips or the event sender drops.
///
/// `events` carries raw platform tab notifications; debouncing and
/// fingerprint gating happen downstream in the engine.
pub async fn run_sync_loop<R, S>(
    client: Arc<VaultClient<R>>,
    source: Arc<S>,
    mut events: mpsc::UnboundedReceiver<TabEventKind>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: Relay,
    S: TabSource,
{
    let debounce = tokio::time::sleep(DEBOUNCE_WINDOW);
    tokio::pin!(debounce);
    let mut debounce_armed = false;

    let mut fallback = tokio::time::interval(FALLBACK_INTERVAL);
    fallback.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first interval tick fires immediately; skip it.
    fallback.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("sync loop stopping");
                    return;
                }
            }

            event = events.recv() => {
                let Some(kind) = event else {
                    debug!("tab event channel closed, sync loop stopping");
                    return;
                };
                if client.on_tab_event(kind) {
                    // Re-arm from now, collapsing the burst.
                    debounce.as_mut().reset(Instant::now() + DEBOUNCE_WINDOW);
                    debounce_armed = true;
                }
            }

            _ = &mut debounce, if debounce_armed => {
                debounce_armed = false;
                if client.on_debounce_fired() {
                    sync_once(&client, source.as_ref()).await;
                }
            }

            _ = fallback.tick() => {
                if client.on_fallback_tick() {
                    debug!("fallback tick triggered a sync pass");
                    sync_once(&client, source.as_ref()).await;
                }
            }
        }
    }
}

async fn sync_once<R: Relay, S: TabSource>(client: &VaultClient<R>, source: &S) {
    let mut tabs = source.current_tabs().await;
    if let Err(e) = client.sync_pass(&mut tabs).await {
        warn!(error = %e, "sync pass failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockRelay;
    use tabvault_types::DeviceId;

    struct FixedTabs(std::sync::Mutex<Vec<TabRecord>>);

    #[async_trait]
    impl TabSource for FixedTabs {
        async fn current_tabs(&self) -> Vec<TabRecord> {
            self.0.lock().unwrap().clone()
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

    async fn spawn_loop(
        relay: &Arc<MockRelay>,
        source: Arc<FixedTabs>,
    ) -> (
        Arc<VaultClient<MockRelay>>,
        mpsc::UnboundedSender<TabEventKind>,
        watch::Sender<bool>,
    ) {
        let client = Arc::new(VaultClient::new(
            relay.clone(),
            DeviceId::random(),
            "laptop",
        ));
        client.enroll("pw").await.unwrap();
        // Enrollment schedules the forced first sync; run it inline so
        // the loop starts clean.
        let mut tabs = source.current_tabs().await;
        client.sync_pass(&mut tabs).await.unwrap();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_sync_loop(
            client.clone(),
            source,
            event_rx,
            shutdown_rx,
        ));
        (client, event_tx, shutdown_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_events_coalesces_into_one_upload() {
        let relay = Arc::new(MockRelay::new());
        let source = Arc::new(FixedTabs(std::sync::Mutex::new(vec![tab("https://a")])));
        let (_client, events, shutdown) = spawn_loop(&relay, source.clone()).await;
        assert_eq!(relay.snapshot_count(), 1);

        // The workspace changes once, but the platform fires a burst.
        *source.0.lock().unwrap() = vec![tab("https://a"), tab("https://b")];
        for _ in 0..5 {
            events.send(TabEventKind::Updated).unwrap();
        }
        tokio::time::sleep(DEBOUNCE_WINDOW * 2).await;

        assert_eq!(relay.snapshot_count(), 2);
        shutdown.send(true).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn focus_events_never_reach_the_relay() {
        let relay = Arc::new(MockRelay::new());
        let source = Arc::new(FixedTabs(std::sync::Mutex::new(vec![tab("https://a")])));
        let (_client, events, shutdown) = spawn_loop(&relay, source).await;
        assert_eq!(relay.snapshot_count(), 1);

        events.send(TabEventKind::Activated).unwrap();
        events.send(TabEventKind::WindowFocusChanged).unwrap();
        tokio::time::sleep(DEBOUNCE_WINDOW * 2).await;

        assert_eq!(relay.snapshot_count(), 1);
        shutdown.send(true).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_workspace_stays_quiet_across_fallback_ticks() {
        let relay = Arc::new(MockRelay::new());
        let source = Arc::new(FixedTabs(std::sync::Mutex::new(vec![tab("https://a")])));
        let (_client, _events, shutdown) = spawn_loop(&relay, source).await;
        assert_eq!(relay.snapshot_count(), 1);

        // Several fallback periods pass; the fingerprint gate stops the
        // periodic captures from turning into uploads.
        tokio::time::sleep(FALLBACK_INTERVAL * 3).await;
        assert_eq!(relay.snapshot_count(), 1);
        shutdown.send(true).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_recovers_a_change_whose_debounce_was_lost() {
        let relay = Arc::new(MockRelay::new());
        let source = Arc::new(FixedTabs(std::sync::Mutex::new(vec![tab("https://a")])));
        let (client, _events, shutdown) = spawn_loop(&relay, source.clone()).await;
        assert_eq!(relay.snapshot_count(), 1);

        // A change happens but the event (and with it the debounce) is
        // lost, as after a host suspend. Only the dirty flag survives.
        *source.0.lock().unwrap() = vec![tab("https://changed")];
        client.on_tab_event(TabEventKind::Updated);

        tokio::time::sleep(FALLBACK_INTERVAL + DEBOUNCE_WINDOW).await;
        assert_eq!(relay.snapshot_count(), 2);
        shutdown.send(true).unwrap();
    }
}
