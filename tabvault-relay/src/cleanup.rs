//! Background cleanup task.
//!
//! Periodically lapses overdue pending restore requests and prunes
//! snapshots past the retention window.

use crate::config::{CleanupConfig, StorageConfig};
use crate::server::current_timestamp;
use crate::storage::{RelayStore, SqliteStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Spawn the background cleanup task.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_task(
    store: Arc<SqliteStore>,
    config: CleanupConfig,
    storage_config: StorageConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("cleanup task disabled");
            return;
        }

        tracing::info!(interval_secs = config.interval_secs, "cleanup task started");
        let mut timer = interval(Duration::from_secs(config.interval_secs));

        loop {
            timer.tick().await;

            match store
                .cleanup(current_timestamp(), storage_config.snapshot_retention_secs)
                .await
            {
                Ok(stats) => {
                    if stats.restores_lapsed > 0 || stats.snapshots_deleted > 0 {
                        tracing::info!(
                            restores_lapsed = stats.restores_lapsed,
                            snapshots_deleted = stats.snapshots_deleted,
                            "cleanup pass"
                        );
                    } else {
                        tracing::debug!("cleanup pass, nothing to do");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "cleanup pass failed");
                }
            }
        }
    })
}
