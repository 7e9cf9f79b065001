// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Append-only snapshot history in SQLite.
//!
//! Every sync cycle captures each tenant's firewall rules and URL block list
//! as an immutable, sequence-numbered snapshot. Snapshots are never updated
//! or deleted; triggers in the schema enforce this.
//!
//! # Layout
//!
//! ```text
//! tenants(tenant_id PK, first_seen_at)
//! snapshots(tenant_id, kind, sequence, snapshot_key, taken_at, payload_hash, payload)
//!   PK (tenant_id, kind, sequence)
//!   UNIQUE (tenant_id, snapshot_key)      snapshot_key = "{sequence}-{kind}"
//! ```
//!
//! Sequences start at 1 per (tenant, kind) and are allocated inside the
//! insert transaction, so they never skip or repeat.
//!
//! # Bootstrap and Collisions
//!
//! The schema version lives in `PRAGMA user_version`. Opening a path that
//! holds something else (a different version, foreign tables, or a file that
//! is not SQLite at all) is a collision:
//!
//! ```text
//! open ──► probe ──► fresh file ──► create schema ──► ready
//!            │
//!            ├─► ours (user_version matches) ──► ready
//!            │
//!            └─► collision ──► move file (+ -wal/-shm) to
//!                              <archive_dir>/<name>-<YYYYmmddTHHMMSS.fffZ>
//!                              and try again
//! ```
//!
//! History is never overwritten. After `max_bootstrap_attempts` the store
//! gives up with `BootstrapExhausted`, leaving the last colliding file where
//! it was.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with capped exponential backoff.

use crate::config::StoreConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::model::{PolicyRule, Snapshot, SnapshotKind, SnapshotPayload};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Value of `PRAGMA user_version` for stores created by this engine.
pub const SCHEMA_VERSION: i64 = 1;

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE tenants (
        tenant_id TEXT PRIMARY KEY,
        first_seen_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE snapshots (
        tenant_id TEXT NOT NULL REFERENCES tenants(tenant_id),
        kind TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        snapshot_key TEXT NOT NULL,
        taken_at INTEGER NOT NULL,
        payload_hash TEXT NOT NULL,
        payload TEXT NOT NULL,
        PRIMARY KEY (tenant_id, kind, sequence),
        UNIQUE (tenant_id, snapshot_key)
    )
    "#,
    r#"
    CREATE TRIGGER snapshots_no_update BEFORE UPDATE ON snapshots
    BEGIN
        SELECT RAISE(ABORT, 'snapshots are immutable');
    END
    "#,
    r#"
    CREATE TRIGGER snapshots_no_delete BEFORE DELETE ON snapshots
    BEGIN
        SELECT RAISE(ABORT, 'snapshots are immutable');
    END
    "#,
];

const REQUIRED_TABLES: [&str; 2] = ["snapshots", "tenants"];

/// Check if an error is a retryable SQLite busy/locked error
pub fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            // Fallback to message matching
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Whether SQLite refused the file itself (SQLITE_CORRUPT = 11, SQLITE_NOTADB = 26).
fn is_foreign_file_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                if code == "11" || code == "26" {
                    return true;
                }
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("not a database") || msg.contains("malformed")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                metrics::store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

fn payload_hash(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotRow {
    tenant_id: String,
    kind: String,
    sequence: i64,
    taken_at: i64,
    payload_hash: String,
    payload: String,
}

impl SnapshotRow {
    fn into_snapshot(self) -> Result<Snapshot> {
        let kind = SnapshotKind::parse(&self.kind).ok_or_else(|| {
            ReplicationError::Internal(format!("unknown snapshot kind '{}'", self.kind))
        })?;

        if payload_hash(&self.payload) != self.payload_hash {
            return Err(ReplicationError::Internal(format!(
                "payload hash mismatch for {} snapshot {}-{}",
                self.tenant_id, self.sequence, self.kind
            )));
        }

        let payload = match kind {
            SnapshotKind::FwRules => {
                SnapshotPayload::FwRules(serde_json::from_str::<Vec<PolicyRule>>(&self.payload)?)
            }
            SnapshotKind::UrlBlocklist => {
                SnapshotPayload::UrlBlocklist(serde_json::from_str::<Vec<String>>(&self.payload)?)
            }
        };

        let taken_at = DateTime::<Utc>::from_timestamp_millis(self.taken_at).ok_or_else(|| {
            ReplicationError::Internal(format!("invalid taken_at {}", self.taken_at))
        })?;

        Ok(Snapshot {
            tenant_id: self.tenant_id,
            sequence: self.sequence,
            taken_at,
            kind,
            payload_hash: self.payload_hash,
            payload,
        })
    }
}

const SELECT_SNAPSHOT: &str =
    "SELECT tenant_id, kind, sequence, taken_at, payload_hash, payload FROM snapshots";

/// Immutable snapshot history backed by SQLite.
pub struct SnapshotStore {
    pool: SqlitePool,
    path: String,
}

impl SnapshotStore {
    /// Open (bootstrapping if needed) the store described by `config`.
    ///
    /// # Errors
    ///
    /// `BootstrapExhausted` when every attempt collided. Other SQLite or
    /// filesystem errors propagate as-is.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let path = config.sqlite_path.clone();
        let max_attempts = config.max_bootstrap_attempts.max(1);
        info!(path = %path, "Opening snapshot store");

        for attempt in 1..=max_attempts {
            let reason = match Self::connect(config).await {
                Ok(pool) => match Self::bootstrap(&pool).await {
                    Ok(()) => {
                        debug!(path = %path, attempt, "Snapshot store ready");
                        return Ok(Self { pool, path });
                    }
                    Err(ReplicationError::StoreCollision(reason)) => {
                        pool.close().await;
                        reason
                    }
                    Err(ReplicationError::SnapshotStore(e)) if is_foreign_file_error(&e) => {
                        pool.close().await;
                        e.to_string()
                    }
                    Err(e) => {
                        pool.close().await;
                        return Err(e);
                    }
                },
                Err(e) if is_foreign_file_error(&e) => e.to_string(),
                Err(e) => return Err(e.into()),
            };

            warn!(path = %path, attempt, max_attempts, reason = %reason, "Snapshot store collision");

            if config.is_in_memory() {
                return Err(ReplicationError::StoreCollision(reason));
            }
            if attempt == max_attempts {
                break;
            }
            Self::archive(Path::new(&path), config.archive_dir.as_deref()).await?;
        }

        Err(ReplicationError::BootstrapExhausted {
            path,
            attempts: max_attempts,
        })
    }

    async fn connect(config: &StoreConfig) -> std::result::Result<SqlitePool, sqlx::Error> {
        if config.is_in_memory() {
            // One connection held forever: each new connection is a new database.
            let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
            return SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await;
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.sqlite_path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        SqlitePoolOptions::new()
            .max_connections(2) // Low concurrency needed
            .connect_with(options)
            .await
    }

    /// Create the schema on a fresh database, accept our own, reject anything else.
    async fn bootstrap(pool: &SqlitePool) -> Result<()> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(pool)
            .await?;
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_all(pool)
        .await?;

        if version == SCHEMA_VERSION {
            let missing: Vec<&str> = REQUIRED_TABLES
                .iter()
                .copied()
                .filter(|t| !tables.iter().any(|have| have.as_str() == *t))
                .collect();
            if missing.is_empty() {
                return Ok(());
            }
            return Err(ReplicationError::StoreCollision(format!(
                "schema version {} but missing tables {:?}",
                version, missing
            )));
        }

        if version != 0 {
            return Err(ReplicationError::StoreCollision(format!(
                "unexpected schema version {} (expected {})",
                version, SCHEMA_VERSION
            )));
        }
        if !tables.is_empty() {
            return Err(ReplicationError::StoreCollision(format!(
                "unrecognized tables {:?}",
                tables
            )));
        }

        let mut tx = pool.begin().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(schema_version = SCHEMA_VERSION, "Created snapshot store schema");
        Ok(())
    }

    /// Move a colliding store (and its WAL siblings) into the archive.
    async fn archive(path: &Path, archive_dir: Option<&str>) -> Result<PathBuf> {
        let dir = match archive_dir {
            Some(dir) => PathBuf::from(dir),
            None => path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        tokio::fs::create_dir_all(&dir).await?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                ReplicationError::Config(format!("store path {} has no file name", path.display()))
            })?;

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let mut target = dir.join(format!("{}-{}", file_name, stamp));
        let mut counter = 1;
        while tokio::fs::try_exists(&target).await? {
            target = dir.join(format!("{}-{}-{}", file_name, stamp, counter));
            counter += 1;
        }

        tokio::fs::rename(path, &target).await?;
        for suffix in ["-wal", "-shm"] {
            let sibling = PathBuf::from(format!("{}{}", path.display(), suffix));
            if tokio::fs::try_exists(&sibling).await? {
                let moved = PathBuf::from(format!("{}{}", target.display(), suffix));
                tokio::fs::rename(&sibling, &moved).await?;
            }
        }

        metrics::record_store_archived();
        warn!(from = %path.display(), to = %target.display(), "Archived colliding snapshot store");
        Ok(target)
    }

    /// Register a tenant on first use. Returns `true` if it was new.
    pub async fn ensure_tenant(&self, tenant_id: &str) -> Result<bool> {
        let pool = &self.pool;
        let now = Utc::now().timestamp_millis();

        let result = execute_with_retry("tenant_register", move || async move {
            sqlx::query(
                "INSERT INTO tenants (tenant_id, first_seen_at) VALUES (?, ?) \
                 ON CONFLICT(tenant_id) DO NOTHING",
            )
            .bind(tenant_id)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        let created = result.rows_affected() == 1;
        if created {
            info!(tenant_id = %tenant_id, "Registered tenant in snapshot store");
        }
        Ok(created)
    }

    /// Append a snapshot and return its sequence number.
    pub async fn write(
        &self,
        tenant_id: &str,
        kind: SnapshotKind,
        payload: &SnapshotPayload,
    ) -> Result<i64> {
        if payload.kind() != kind {
            return Err(ReplicationError::InvalidState {
                expected: kind.to_string(),
                actual: payload.kind().to_string(),
            });
        }

        self.ensure_tenant(tenant_id).await?;

        let body = serde_json::to_string(payload)?;
        let hash = payload_hash(&body);
        let taken_at = Utc::now().timestamp_millis();
        let kind_str = kind.as_str();
        let pool = &self.pool;
        let body = body.as_str();
        let hash = hash.as_str();

        let sequence = execute_with_retry("snapshot_write", move || async move {
            let mut tx = pool.begin().await?;
            let next: i64 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM snapshots WHERE tenant_id = ? AND kind = ?",
            )
            .bind(tenant_id)
            .bind(kind_str)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO snapshots
                    (tenant_id, kind, sequence, snapshot_key, taken_at, payload_hash, payload)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(tenant_id)
            .bind(kind_str)
            .bind(next)
            .bind(crate::model::snapshot_key(next, kind))
            .bind(taken_at)
            .bind(hash)
            .bind(body)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(next)
        })
        .await?;

        metrics::record_snapshot_written(tenant_id, kind_str, payload.len());
        debug!(tenant_id = %tenant_id, kind = kind_str, sequence, entries = payload.len(), "Snapshot written");
        Ok(sequence)
    }

    /// Fetch one snapshot. `None` if that sequence was never written.
    pub async fn read(
        &self,
        tenant_id: &str,
        kind: SnapshotKind,
        sequence: i64,
    ) -> Result<Option<Snapshot>> {
        let pool = &self.pool;
        let sql = format!(
            "{} WHERE tenant_id = ? AND kind = ? AND sequence = ?",
            SELECT_SNAPSHOT
        );
        let sql = sql.as_str();
        let kind_str = kind.as_str();

        let row = execute_with_retry("snapshot_read", move || async move {
            sqlx::query_as::<_, SnapshotRow>(sql)
                .bind(tenant_id)
                .bind(kind_str)
                .bind(sequence)
                .fetch_optional(pool)
                .await
        })
        .await?;

        row.map(SnapshotRow::into_snapshot).transpose()
    }

    /// Fetch a snapshot by its exact `{sequence}-{kind}` key.
    pub async fn read_by_key(&self, tenant_id: &str, key: &str) -> Result<Option<Snapshot>> {
        let pool = &self.pool;
        let sql = format!("{} WHERE tenant_id = ? AND snapshot_key = ?", SELECT_SNAPSHOT);
        let sql = sql.as_str();

        let row = execute_with_retry("snapshot_read", move || async move {
            sqlx::query_as::<_, SnapshotRow>(sql)
                .bind(tenant_id)
                .bind(key)
                .fetch_optional(pool)
                .await
        })
        .await?;

        row.map(SnapshotRow::into_snapshot).transpose()
    }

    /// Most recent snapshot of `kind` for a tenant.
    pub async fn latest(&self, tenant_id: &str, kind: SnapshotKind) -> Result<Option<Snapshot>> {
        self.nth_previous(tenant_id, kind, 0).await
    }

    /// The snapshot `n` positions before the latest (0 = latest).
    pub async fn nth_previous(
        &self,
        tenant_id: &str,
        kind: SnapshotKind,
        n: u32,
    ) -> Result<Option<Snapshot>> {
        let pool = &self.pool;
        let sql = format!(
            "{} WHERE tenant_id = ? AND kind = ? ORDER BY sequence DESC LIMIT 1 OFFSET ?",
            SELECT_SNAPSHOT
        );
        let sql = sql.as_str();
        let kind_str = kind.as_str();
        let offset = i64::from(n);

        let row = execute_with_retry("snapshot_read", move || async move {
            sqlx::query_as::<_, SnapshotRow>(sql)
                .bind(tenant_id)
                .bind(kind_str)
                .bind(offset)
                .fetch_optional(pool)
                .await
        })
        .await?;

        row.map(SnapshotRow::into_snapshot).transpose()
    }

    /// Highest sequence written for (tenant, kind), if any.
    pub async fn latest_sequence(&self, tenant_id: &str, kind: SnapshotKind) -> Result<Option<i64>> {
        let pool = &self.pool;
        let kind_str = kind.as_str();

        let sequence: Option<i64> = execute_with_retry("snapshot_read", move || async move {
            sqlx::query_scalar("SELECT MAX(sequence) FROM snapshots WHERE tenant_id = ? AND kind = ?")
                .bind(tenant_id)
                .bind(kind_str)
                .fetch_one(pool)
                .await
        })
        .await?;

        Ok(sequence)
    }

    /// Registered tenants in first-seen order.
    pub async fn tenants(&self) -> Result<Vec<String>> {
        let pool = &self.pool;
        let tenants = execute_with_retry("tenant_list", move || async move {
            sqlx::query_scalar("SELECT tenant_id FROM tenants ORDER BY first_seen_at, tenant_id")
                .fetch_all(pool)
                .await
        })
        .await?;
        Ok(tenants)
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("store_checkpoint", move || async move {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!(path = %self.path, "Snapshot store closed");
    }
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rules(names: &[&str]) -> SnapshotPayload {
        SnapshotPayload::FwRules(
            names
                .iter()
                .enumerate()
                .map(|(i, n)| PolicyRule::new(*n, i as i64 + 1).with_id(100 + i as i64))
                .collect(),
        )
    }

    fn urls(entries: &[&str]) -> SnapshotPayload {
        SnapshotPayload::UrlBlocklist(entries.iter().map(|s| s.to_string()).collect())
    }

    async fn write_foreign_db(path: &Path) {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await.unwrap();
        sqlx::query("CREATE TABLE inventory (sku TEXT PRIMARY KEY, quantity INTEGER)")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;
    }

    fn archived_files(dir: &Path, prefix: &str) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with(&format!("{}-", prefix)) && !n.ends_with("-wal") && !n.ends_with("-shm"))
            .collect()
    }

    #[tokio::test]
    async fn test_write_assigns_gapless_sequences() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(&StoreConfig::at(dir.path().join("s.db")))
            .await
            .unwrap();

        assert_eq!(store.write("PARENT", SnapshotKind::FwRules, &rules(&["A"])).await.unwrap(), 1);
        assert_eq!(store.write("PARENT", SnapshotKind::FwRules, &rules(&["A", "B"])).await.unwrap(), 2);
        // Independent per kind and per tenant
        assert_eq!(store.write("PARENT", SnapshotKind::UrlBlocklist, &urls(&["a.com"])).await.unwrap(), 1);
        assert_eq!(store.write("SUB1", SnapshotKind::FwRules, &rules(&[])).await.unwrap(), 1);
        assert_eq!(store.latest_sequence("PARENT", SnapshotKind::FwRules).await.unwrap(), Some(2));
        assert_eq!(store.latest_sequence("SUB2", SnapshotKind::FwRules).await.unwrap(), None);

        store.close().await;
    }

    #[tokio::test]
    async fn test_read_roundtrip_and_missing() {
        let store = SnapshotStore::open(&StoreConfig::in_memory()).await.unwrap();
        let payload = rules(&["Allow Web", "Block Bad"]);
        store.write("PARENT", SnapshotKind::FwRules, &payload).await.unwrap();

        let snap = store.read("PARENT", SnapshotKind::FwRules, 1).await.unwrap().unwrap();
        assert_eq!(snap.payload, payload);
        assert_eq!(snap.sequence, 1);
        assert_eq!(snap.key(), "1-FW_RULES");
        assert_eq!(snap.payload_hash.len(), 64);

        assert!(store.read("PARENT", SnapshotKind::FwRules, 2).await.unwrap().is_none());
        assert!(store.read("PARENT", SnapshotKind::UrlBlocklist, 1).await.unwrap().is_none());
        assert!(store.read("SUB9", SnapshotKind::FwRules, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_by_key_is_exact() {
        let store = SnapshotStore::open(&StoreConfig::in_memory()).await.unwrap();
        for _ in 0..11 {
            store.write("SUB1", SnapshotKind::UrlBlocklist, &urls(&["x.com"])).await.unwrap();
        }

        let snap = store.read_by_key("SUB1", "1-URL_BLOCKLIST").await.unwrap().unwrap();
        assert_eq!(snap.sequence, 1);
        let snap = store.read_by_key("SUB1", "11-URL_BLOCKLIST").await.unwrap().unwrap();
        assert_eq!(snap.sequence, 11);
        assert!(store.read_by_key("SUB1", "1-FW_RULES").await.unwrap().is_none());
        assert!(store.read_by_key("SUB1", "1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_and_nth_previous() {
        let store = SnapshotStore::open(&StoreConfig::in_memory()).await.unwrap();
        assert!(store.latest("PARENT", SnapshotKind::FwRules).await.unwrap().is_none());

        store.write("PARENT", SnapshotKind::FwRules, &rules(&["A"])).await.unwrap();
        store.write("PARENT", SnapshotKind::FwRules, &rules(&["A", "B"])).await.unwrap();
        store.write("PARENT", SnapshotKind::FwRules, &rules(&["A", "B", "C"])).await.unwrap();

        let latest = store.latest("PARENT", SnapshotKind::FwRules).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 3);
        let prev = store.nth_previous("PARENT", SnapshotKind::FwRules, 1).await.unwrap().unwrap();
        assert_eq!(prev.sequence, 2);
        assert_eq!(prev.payload.len(), 2);
        assert!(store.nth_previous("PARENT", SnapshotKind::FwRules, 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_kind_payload_mismatch_rejected() {
        let store = SnapshotStore::open(&StoreConfig::in_memory()).await.unwrap();
        let err = store
            .write("PARENT", SnapshotKind::FwRules, &urls(&["a.com"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidState { .. }));
        assert_eq!(store.latest_sequence("PARENT", SnapshotKind::FwRules).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_snapshots_are_immutable() {
        let store = SnapshotStore::open(&StoreConfig::in_memory()).await.unwrap();
        store.write("PARENT", SnapshotKind::UrlBlocklist, &urls(&["a.com"])).await.unwrap();

        let update = sqlx::query("UPDATE snapshots SET payload = '[]'")
            .execute(&store.pool)
            .await;
        assert!(update.is_err());
        let delete = sqlx::query("DELETE FROM snapshots").execute(&store.pool).await;
        assert!(delete.is_err());

        let snap = store.latest("PARENT", SnapshotKind::UrlBlocklist).await.unwrap().unwrap();
        assert_eq!(snap.payload, urls(&["a.com"]));
    }

    #[tokio::test]
    async fn test_tampered_payload_detected() {
        let store = SnapshotStore::open(&StoreConfig::in_memory()).await.unwrap();
        store.write("PARENT", SnapshotKind::UrlBlocklist, &urls(&["a.com"])).await.unwrap();

        sqlx::query("DROP TRIGGER snapshots_no_update").execute(&store.pool).await.unwrap();
        sqlx::query(r#"UPDATE snapshots SET payload = '["evil.com"]'"#)
            .execute(&store.pool)
            .await
            .unwrap();

        let err = store.read("PARENT", SnapshotKind::UrlBlocklist, 1).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Internal(_)));
    }

    #[tokio::test]
    async fn test_tenants_registered_once() {
        let store = SnapshotStore::open(&StoreConfig::in_memory()).await.unwrap();
        assert!(store.ensure_tenant("PARENT").await.unwrap());
        assert!(!store.ensure_tenant("PARENT").await.unwrap());
        store.write("SUB1", SnapshotKind::FwRules, &rules(&[])).await.unwrap();
        store.write("SUB1", SnapshotKind::FwRules, &rules(&[])).await.unwrap();

        let tenants = store.tenants().await.unwrap();
        assert_eq!(tenants.len(), 2);
        assert!(tenants.contains(&"PARENT".to_string()));
        assert!(tenants.contains(&"SUB1".to_string()));
    }

    #[tokio::test]
    async fn test_history_survives_reopen() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::at(dir.path().join("history.db"));

        {
            let store = SnapshotStore::open(&config).await.unwrap();
            store.write("PARENT", SnapshotKind::FwRules, &rules(&["A"])).await.unwrap();
            store.close().await;
        }
        {
            let store = SnapshotStore::open(&config).await.unwrap();
            assert_eq!(store.write("PARENT", SnapshotKind::FwRules, &rules(&["A"])).await.unwrap(), 2);
            store.close().await;
        }
        assert!(archived_files(dir.path(), "history.db").is_empty());
    }

    #[tokio::test]
    async fn test_collision_archived_then_recreated() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("snapshots.db");
        write_foreign_db(&db_path).await;

        let store = SnapshotStore::open(&StoreConfig::at(&db_path)).await.unwrap();
        assert_eq!(store.write("PARENT", SnapshotKind::FwRules, &rules(&["A"])).await.unwrap(), 1);
        store.close().await;

        let archived = archived_files(dir.path(), "snapshots.db");
        assert_eq!(archived.len(), 1, "archived: {:?}", archived);
        assert!(archived[0].ends_with('Z'));
    }

    #[tokio::test]
    async fn test_collision_archives_into_archive_dir() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("archive");
        let db_path = dir.path().join("snapshots.db");
        write_foreign_db(&db_path).await;

        let mut config = StoreConfig::at(&db_path);
        config.archive_dir = Some(archive.to_string_lossy().to_string());
        let store = SnapshotStore::open(&config).await.unwrap();
        store.close().await;

        assert_eq!(archived_files(&archive, "snapshots.db").len(), 1);
    }

    #[tokio::test]
    async fn test_non_sqlite_file_is_collision() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("snapshots.db");
        std::fs::write(&db_path, "this is a plain text file, not a database\n".repeat(64)).unwrap();

        let store = SnapshotStore::open(&StoreConfig::at(&db_path)).await.unwrap();
        store.close().await;

        assert_eq!(archived_files(dir.path(), "snapshots.db").len(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_exhausted_leaves_file_in_place() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("snapshots.db");
        write_foreign_db(&db_path).await;

        let mut config = StoreConfig::at(&db_path);
        config.max_bootstrap_attempts = 1;
        let err = SnapshotStore::open(&config).await.unwrap_err();

        assert!(matches!(err, ReplicationError::BootstrapExhausted { attempts: 1, .. }));
        assert!(err.is_fatal());
        assert!(db_path.exists());
        assert!(archived_files(dir.path(), "snapshots.db").is_empty());
    }

    #[tokio::test]
    async fn test_wrong_schema_version_is_collision() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("snapshots.db");
        {
            let options = SqliteConnectOptions::new().filename(&db_path).create_if_missing(true);
            let pool = SqlitePool::connect_with(options).await.unwrap();
            sqlx::query("PRAGMA user_version = 99").execute(&pool).await.unwrap();
            pool.close().await;
        }

        let store = SnapshotStore::open(&StoreConfig::at(&db_path)).await.unwrap();
        store.close().await;
        assert_eq!(archived_files(dir.path(), "snapshots.db").len(), 1);
    }

    #[tokio::test]
    async fn test_archive_name_collision_gets_suffix() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("a.db");
        std::fs::write(&first, "one").unwrap();
        let target1 = SnapshotStore::archive(&first, None).await.unwrap();

        std::fs::write(&first, "two").unwrap();
        let target2 = SnapshotStore::archive(&first, None).await.unwrap();

        assert_ne!(target1, target2);
        assert!(target1.exists() && target2.exists());
        assert!(!first.exists());
    }

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_immediately() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Ok(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count, 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;

        assert!(result.is_err());
        // Non-busy errors should not retry
        assert_eq!(attempt_count, 1);
    }

    #[test]
    fn test_is_sqlite_busy_error_row_not_found() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::RowNotFound));
        assert!(!is_sqlite_busy_error(&sqlx::Error::PoolTimedOut));
        assert!(!is_foreign_file_error(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn test_payload_hash_is_sha256_hex() {
        assert_eq!(
            payload_hash("[]"),
            "4f53cda18c2baa0c0354bb5f9a3ecbe5ed12ab4d8e11ba873c2f11161202b945"
        );
    }
}
