//! SQLite-backed implementation of [`RelayStore`].

use super::{
    CleanupStats, CompletionOutcome, DeviceRecord, RegistrationOutcome, RelayStore, SnapshotRecord,
};
use crate::error::StorageError;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tabvault_types::{
    DeviceId, KeyEnvelopeUpload, PasswordEnvelope, RecoveryEnvelope, RequestId, RestoreRequest,
    RestoreStatus, SnapshotId,
};

/// Relay storage on a single SQLite database file.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// An in-memory database for tests.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // A single connection so the in-memory database is shared.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                device_id            BLOB PRIMARY KEY,
                device_name          TEXT NOT NULL,
                platform_fingerprint TEXT,
                created_at           INTEGER NOT NULL,
                last_seen            INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                snapshot_id    TEXT PRIMARY KEY,
                device_id      BLOB NOT NULL REFERENCES devices(device_id),
                captured_at    INTEGER NOT NULL,
                iv             TEXT NOT NULL,
                encrypted_blob TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_snapshots_device
             ON snapshots(device_id, captured_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS restore_requests (
                request_id    TEXT PRIMARY KEY,
                source_device BLOB NOT NULL,
                target_device BLOB NOT NULL,
                snapshot_id   TEXT NOT NULL,
                status        TEXT NOT NULL,
                error_msg     TEXT,
                created_at    INTEGER NOT NULL,
                expires_at    INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_restores_target
             ON restore_requests(target_device, status)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_restores_expiry
             ON restore_requests(expires_at)",
        )
        .execute(&self.pool)
        .await?;

        // One account per deployment, so one envelope row.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS key_envelopes (
                id                            INTEGER PRIMARY KEY CHECK (id = 1),
                encrypted_master_key          TEXT NOT NULL,
                master_key_iv                 TEXT NOT NULL,
                salt                          TEXT NOT NULL,
                kdf_iterations                INTEGER NOT NULL,
                recovery_encrypted_master_key TEXT,
                recovery_key_iv               TEXT,
                recovery_key_salt             TEXT,
                recovery_kdf_iterations       INTEGER,
                recovery_hash                 TEXT,
                recovery_hash_salt            TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    device_id: Vec<u8>,
    device_name: String,
    platform_fingerprint: Option<String>,
    created_at: i64,
    last_seen: i64,
}

impl TryFrom<DeviceRow> for DeviceRecord {
    type Error = StorageError;

    fn try_from(row: DeviceRow) -> Result<Self, StorageError> {
        let device_id = DeviceId::from_bytes(&row.device_id)
            .ok_or_else(|| StorageError::CorruptRow("invalid device id".into()))?;
        Ok(DeviceRecord {
            device_id,
            device_name: row.device_name,
            platform_fingerprint: row.platform_fingerprint,
            created_at: row.created_at,
            last_seen: row.last_seen,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    snapshot_id: String,
    device_id: Vec<u8>,
    captured_at: i64,
    iv: String,
    encrypted_blob: String,
}

impl TryFrom<SnapshotRow> for SnapshotRecord {
    type Error = StorageError;

    fn try_from(row: SnapshotRow) -> Result<Self, StorageError> {
        let snapshot_id = SnapshotId::parse(&row.snapshot_id)
            .ok_or_else(|| StorageError::CorruptRow("invalid snapshot id".into()))?;
        let device_id = DeviceId::from_bytes(&row.device_id)
            .ok_or_else(|| StorageError::CorruptRow("invalid device id".into()))?;
        Ok(SnapshotRecord {
            snapshot_id,
            device_id,
            captured_at: row.captured_at,
            iv: row.iv,
            encrypted_blob: row.encrypted_blob,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RestoreRow {
    request_id: String,
    source_device: Vec<u8>,
    target_device: Vec<u8>,
    snapshot_id: String,
    status: String,
    error_msg: Option<String>,
    created_at: i64,
    expires_at: i64,
}

impl TryFrom<RestoreRow> for RestoreRequest {
    type Error = StorageError;

    fn try_from(row: RestoreRow) -> Result<Self, StorageError> {
        let id = RequestId::parse(&row.request_id)
            .ok_or_else(|| StorageError::CorruptRow("invalid request id".into()))?;
        let source_device = DeviceId::from_bytes(&row.source_device)
            .ok_or_else(|| StorageError::CorruptRow("invalid source device id".into()))?;
        let target_device = DeviceId::from_bytes(&row.target_device)
            .ok_or_else(|| StorageError::CorruptRow("invalid target device id".into()))?;
        let snapshot_id = SnapshotId::parse(&row.snapshot_id)
            .ok_or_else(|| StorageError::CorruptRow("invalid snapshot id".into()))?;
        let status = row
            .status
            .parse::<RestoreStatus>()
            .map_err(|e| StorageError::CorruptRow(e.to_string()))?;
        Ok(RestoreRequest {
            id,
            source_device,
            target_device,
            snapshot_id,
            status,
            error: row.error_msg,
            created_at: row.created_at,
            expires_at: row.expires_at,
        })
    }
}

#[async_trait]
impl RelayStore for SqliteStore {
    async fn register_device(
        &self,
        device_id: DeviceId,
        device_name: &str,
        platform_fingerprint: Option<&str>,
        now: i64,
    ) -> Result<RegistrationOutcome, StorageError> {
        if let Some(fingerprint) = platform_fingerprint {
            let existing: Option<DeviceRow> = sqlx::query_as(
                "SELECT * FROM devices WHERE platform_fingerprint = ? LIMIT 1",
            )
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = existing {
                // Same installation re-registering, keep its identity.
                sqlx::query(
                    "UPDATE devices SET device_name = ?, last_seen = ? WHERE device_id = ?",
                )
                .bind(device_name)
                .bind(now)
                .bind(&row.device_id)
                .execute(&self.pool)
                .await?;

                let mut device = DeviceRecord::try_from(row)?;
                device.device_name = device_name.to_string();
                device.last_seen = now;
                return Ok(RegistrationOutcome {
                    device,
                    adopted: true,
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO devices (device_id, device_name, platform_fingerprint, created_at, last_seen)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
                device_name = excluded.device_name,
                platform_fingerprint = excluded.platform_fingerprint,
                last_seen = excluded.last_seen
            "#,
        )
        .bind(device_id.as_bytes().as_slice())
        .bind(device_name)
        .bind(platform_fingerprint)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row: DeviceRow = sqlx::query_as("SELECT * FROM devices WHERE device_id = ?")
            .bind(device_id.as_bytes().as_slice())
            .fetch_one(&self.pool)
            .await?;

        Ok(RegistrationOutcome {
            device: row.try_into()?,
            adopted: false,
        })
    }

    async fn touch_device(&self, device_id: DeviceId, now: i64) -> Result<bool, StorageError> {
        let result = sqlx::query("UPDATE devices SET last_seen = ? WHERE device_id = ?")
            .bind(now)
            .bind(device_id.as_bytes().as_slice())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_device(&self, device_id: DeviceId) -> Result<Option<DeviceRecord>, StorageError> {
        let row: Option<DeviceRow> = sqlx::query_as("SELECT * FROM devices WHERE device_id = ?")
            .bind(device_id.as_bytes().as_slice())
            .fetch_optional(&self.pool)
            .await?;
        row.map(DeviceRecord::try_from).transpose()
    }

    async fn delete_device(&self, device_id: DeviceId) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM snapshots WHERE device_id = ?")
            .bind(device_id.as_bytes().as_slice())
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE restore_requests SET status = 'expired'
             WHERE (source_device = ? OR target_device = ?) AND status = 'pending'",
        )
        .bind(device_id.as_bytes().as_slice())
        .bind(device_id.as_bytes().as_slice())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM devices WHERE device_id = ?")
            .bind(device_id.as_bytes().as_slice())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_snapshot(&self, record: SnapshotRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (snapshot_id, device_id, captured_at, iv, encrypted_blob)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.snapshot_id.to_string())
        .bind(record.device_id.as_bytes().as_slice())
        .bind(record.captured_at)
        .bind(&record.iv)
        .bind(&record.encrypted_blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_per_device(
        &self,
    ) -> Result<Vec<(SnapshotRecord, DeviceRecord)>, StorageError> {
        let rows: Vec<SnapshotRow> = sqlx::query_as(
            "SELECT * FROM snapshots s
             WHERE s.rowid = (SELECT s2.rowid FROM snapshots s2
                              WHERE s2.device_id = s.device_id
                              ORDER BY s2.captured_at DESC, s2.rowid DESC LIMIT 1)
             ORDER BY s.captured_at DESC, s.rowid DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let snapshot = SnapshotRecord::try_from(row)?;
            let device = self
                .get_device(snapshot.device_id)
                .await?
                .ok_or_else(|| StorageError::CorruptRow("snapshot without device".into()))?;
            out.push((snapshot, device));
        }
        Ok(out)
    }

    async fn latest_for_device(
        &self,
        device: DeviceId,
    ) -> Result<Option<(SnapshotRecord, DeviceRecord)>, StorageError> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            "SELECT * FROM snapshots WHERE device_id = ?
             ORDER BY captured_at DESC, rowid DESC LIMIT 1",
        )
        .bind(device.as_bytes().as_slice())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let snapshot = SnapshotRecord::try_from(row)?;
        let device = self
            .get_device(snapshot.device_id)
            .await?
            .ok_or_else(|| StorageError::CorruptRow("snapshot without device".into()))?;
        Ok(Some((snapshot, device)))
    }

    async fn get_snapshot(
        &self,
        snapshot_id: SnapshotId,
    ) -> Result<Option<SnapshotRecord>, StorageError> {
        let row: Option<SnapshotRow> =
            sqlx::query_as("SELECT * FROM snapshots WHERE snapshot_id = ?")
                .bind(snapshot_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(SnapshotRecord::try_from).transpose()
    }

    async fn create_restore(&self, request: RestoreRequest) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        // One actionable request per target at a time.
        sqlx::query(
            "UPDATE restore_requests SET status = 'expired'
             WHERE target_device = ? AND status = 'pending'",
        )
        .bind(request.target_device.as_bytes().as_slice())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO restore_requests
                (request_id, source_device, target_device, snapshot_id,
                 status, error_msg, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(request.id.to_string())
        .bind(request.source_device.as_bytes().as_slice())
        .bind(request.target_device.as_bytes().as_slice())
        .bind(request.snapshot_id.to_string())
        .bind(request.status.as_str())
        .bind(&request.error)
        .bind(request.created_at)
        .bind(request.expires_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn pending_restore(
        &self,
        target: DeviceId,
        now: i64,
    ) -> Result<Option<RestoreRequest>, StorageError> {
        let row: Option<RestoreRow> = sqlx::query_as(
            "SELECT * FROM restore_requests
             WHERE target_device = ? AND status = 'pending' AND expires_at > ?
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(target.as_bytes().as_slice())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RestoreRequest::try_from).transpose()
    }

    async fn complete_restore(
        &self,
        request: RequestId,
        outcome: RestoreStatus,
        error_msg: Option<&str>,
        now: i64,
    ) -> Result<Option<CompletionOutcome>, StorageError> {
        let id = request.to_string();

        // The guarded update is the race arbiter: only a still-pending,
        // unexpired row takes the reported outcome.
        let result = sqlx::query(
            "UPDATE restore_requests SET status = ?, error_msg = ?
             WHERE request_id = ? AND status = 'pending' AND expires_at > ?",
        )
        .bind(outcome.as_str())
        .bind(error_msg)
        .bind(&id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(Some(CompletionOutcome {
                status: outcome,
                already_resolved: false,
            }));
        }

        let row: Option<RestoreRow> =
            sqlx::query_as("SELECT * FROM restore_requests WHERE request_id = ?")
                .bind(&id)
                .fetch_optional(&self.pool)
                .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let current = RestoreRequest::try_from(row)?;

        if current.status == RestoreStatus::Pending {
            // Pending but past expiry. Record the lapse now rather than
            // waiting for the sweep.
            sqlx::query(
                "UPDATE restore_requests SET status = 'expired'
                 WHERE request_id = ? AND status = 'pending'",
            )
            .bind(&id)
            .execute(&self.pool)
            .await?;
            return Ok(Some(CompletionOutcome {
                status: RestoreStatus::Expired,
                already_resolved: true,
            }));
        }

        Ok(Some(CompletionOutcome {
            status: current.status,
            already_resolved: true,
        }))
    }

    async fn get_restore(
        &self,
        request: RequestId,
    ) -> Result<Option<RestoreRequest>, StorageError> {
        let row: Option<RestoreRow> =
            sqlx::query_as("SELECT * FROM restore_requests WHERE request_id = ?")
                .bind(request.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(RestoreRequest::try_from).transpose()
    }

    async fn put_keys(&self, upload: &KeyEnvelopeUpload) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO key_envelopes (id, encrypted_master_key, master_key_iv, salt, kdf_iterations)
            VALUES (1, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                encrypted_master_key = excluded.encrypted_master_key,
                master_key_iv = excluded.master_key_iv,
                salt = excluded.salt,
                kdf_iterations = excluded.kdf_iterations
            "#,
        )
        .bind(&upload.password.encrypted_master_key)
        .bind(&upload.password.master_key_iv)
        .bind(&upload.password.salt)
        .bind(upload.password.kdf_iterations)
        .execute(&mut *tx)
        .await?;

        if let Some(recovery) = &upload.recovery {
            sqlx::query(
                r#"
                UPDATE key_envelopes SET
                    recovery_encrypted_master_key = ?,
                    recovery_key_iv = ?,
                    recovery_key_salt = ?,
                    recovery_kdf_iterations = ?,
                    recovery_hash = ?,
                    recovery_hash_salt = ?
                WHERE id = 1
                "#,
            )
            .bind(&recovery.recovery_encrypted_master_key)
            .bind(&recovery.recovery_key_iv)
            .bind(&recovery.recovery_key_salt)
            .bind(recovery.kdf_iterations)
            .bind(&upload.recovery_hash)
            .bind(&upload.recovery_hash_salt)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_password_envelope(&self) -> Result<Option<PasswordEnvelope>, StorageError> {
        let row: Option<(String, String, String, u32)> = sqlx::query_as(
            "SELECT encrypted_master_key, master_key_iv, salt, kdf_iterations
             FROM key_envelopes WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(encrypted_master_key, master_key_iv, salt, kdf_iterations)| PasswordEnvelope {
                encrypted_master_key,
                master_key_iv,
                salt,
                kdf_iterations,
            },
        ))
    }

    async fn get_recovery_salt(&self) -> Result<Option<String>, StorageError> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT recovery_hash_salt FROM key_envelopes WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(salt,)| salt))
    }

    async fn get_recovery(
        &self,
    ) -> Result<Option<(RecoveryEnvelope, String)>, StorageError> {
        let row: Option<(
            Option<String>,
            Option<String>,
            Option<String>,
            Option<u32>,
            Option<String>,
        )> = sqlx::query_as(
            "SELECT recovery_encrypted_master_key, recovery_key_iv, recovery_key_salt,
                    recovery_kdf_iterations, recovery_hash
             FROM key_envelopes WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some((key, iv, salt, iterations, hash)) = row else {
            return Ok(None);
        };
        match (key, iv, salt, iterations, hash) {
            (Some(key), Some(iv), Some(salt), Some(iterations), Some(hash)) => Ok(Some((
                RecoveryEnvelope {
                    recovery_encrypted_master_key: key,
                    recovery_key_iv: iv,
                    recovery_key_salt: salt,
                    kdf_iterations: iterations,
                },
                hash,
            ))),
            (None, None, None, None, None) => Ok(None),
            _ => Err(StorageError::CorruptRow(
                "partial recovery envelope".into(),
            )),
        }
    }

    async fn cleanup(&self, now: i64, retention_secs: u64) -> Result<CleanupStats, StorageError> {
        let lapsed = sqlx::query(
            "UPDATE restore_requests SET status = 'expired'
             WHERE status = 'pending' AND expires_at <= ?",
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let cutoff = now - retention_secs as i64;
        // Old snapshots go, except each device's newest and anything a
        // pending restore still points at.
        let deleted = sqlx::query(
            r#"
            DELETE FROM snapshots
            WHERE captured_at <= ?1
              AND EXISTS (
                  SELECT 1 FROM snapshots newer
                  WHERE newer.device_id = snapshots.device_id
                    AND (newer.captured_at > snapshots.captured_at
                         OR (newer.captured_at = snapshots.captured_at
                             AND newer.rowid > snapshots.rowid))
              )
              AND NOT EXISTS (
                  SELECT 1 FROM restore_requests r
                  WHERE r.snapshot_id = snapshots.snapshot_id
                    AND r.status = 'pending'
              )
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(CleanupStats {
            restores_lapsed: lapsed,
            snapshots_deleted: deleted,
        })
    }
}
