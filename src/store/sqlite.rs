//! SQLite record store.
//!
//! One row per `(content_id, format)`, enforced by a UNIQUE constraint so
//! several resolver processes can share the file. Writes run inside
//! `BEGIN IMMEDIATE` transactions; the connection lives behind a mutex and
//! every call hops onto the blocking pool.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use tracing::info;
use uuid::Uuid;

use super::{PersistentStore, StoreError};
use crate::domain::{ContentKey, Format, RecordUpdate, ResolutionRecord, ResolutionStatus};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS resolution_records (
    id                   TEXT PRIMARY KEY,
    content_id           TEXT NOT NULL,
    format               TEXT NOT NULL,
    title                TEXT,
    duration_seconds     INTEGER,
    size_bytes           INTEGER,
    status               TEXT NOT NULL,
    resolved_url         TEXT,
    archive_reference    TEXT,
    error                TEXT,
    promotion_claimed_at TEXT,
    created_at           TEXT NOT NULL,
    resolved_at          TEXT,
    UNIQUE (content_id, format)
);
CREATE INDEX IF NOT EXISTS idx_resolution_records_status ON resolution_records (status);
";

const COLUMNS: &str = "id, content_id, format, title, duration_seconds, size_bytes, status, \
    resolved_url, archive_reference, error, promotion_claimed_at, created_at, resolved_at";

/// rusqlite-backed store
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file and apply the schema
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Database(format!("Failed to create {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn, Some(path))
    }

    /// In-memory database (tests)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<&Path>) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        if let Some(path) = path {
            info!(path = %path.display(), "Opened resolution store");
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Database(format!("Store task failed: {}", e)))?
    }
}

fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {:?}: {}", s, e)))
}

/// Column values as stored, before domain validation
struct RawRecord {
    id: String,
    content_id: String,
    format: String,
    title: Option<String>,
    duration_seconds: Option<i64>,
    size_bytes: Option<i64>,
    status: String,
    resolved_url: Option<String>,
    archive_reference: Option<String>,
    error: Option<String>,
    promotion_claimed_at: Option<String>,
    created_at: String,
    resolved_at: Option<String>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            content_id: row.get(1)?,
            format: row.get(2)?,
            title: row.get(3)?,
            duration_seconds: row.get(4)?,
            size_bytes: row.get(5)?,
            status: row.get(6)?,
            resolved_url: row.get(7)?,
            archive_reference: row.get(8)?,
            error: row.get(9)?,
            promotion_claimed_at: row.get(10)?,
            created_at: row.get(11)?,
            resolved_at: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<ResolutionRecord, StoreError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::Corrupt(format!("bad id {:?}: {}", self.id, e)))?;
        let format: Format = self
            .format
            .parse()
            .map_err(|e: anyhow::Error| StoreError::Corrupt(e.to_string()))?;
        let status = ResolutionStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("bad status {:?}", self.status)))?;

        Ok(ResolutionRecord {
            id,
            content_id: self.content_id,
            format,
            title: self.title,
            duration_seconds: self.duration_seconds.map(|v| v as u64),
            size_bytes: self.size_bytes.map(|v| v as u64),
            status,
            resolved_url: self.resolved_url,
            archive_reference: self.archive_reference,
            error: self.error,
            promotion_claimed_at: self
                .promotion_claimed_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            created_at: parse_timestamp(&self.created_at)?,
            resolved_at: self.resolved_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

fn select_by_key(conn: &Connection, key: &ContentKey) -> Result<Option<ResolutionRecord>, StoreError> {
    let sql = format!(
        "SELECT {} FROM resolution_records WHERE content_id = ?1 AND format = ?2",
        COLUMNS
    );
    conn.query_row(&sql, params![key.content_id(), key.format().as_str()], RawRecord::from_row)
        .optional()?
        .map(RawRecord::into_record)
        .transpose()
}

fn select_by_id(conn: &Connection, id: Uuid) -> Result<Option<ResolutionRecord>, StoreError> {
    let sql = format!("SELECT {} FROM resolution_records WHERE id = ?1", COLUMNS);
    conn.query_row(&sql, params![id.to_string()], RawRecord::from_row)
        .optional()?
        .map(RawRecord::into_record)
        .transpose()
}

#[async_trait]
impl PersistentStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn find_by_key(&self, key: &ContentKey) -> Result<Option<ResolutionRecord>, StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| select_by_key(conn, &key)).await
    }

    async fn insert_pending(&self, key: &ContentKey) -> Result<ResolutionRecord, StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let record = ResolutionRecord::pending(&key);
            let inserted = conn.execute(
                "INSERT INTO resolution_records (id, content_id, format, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.id.to_string(),
                    record.content_id,
                    record.format.as_str(),
                    record.status.as_str(),
                    timestamp(&record.created_at),
                ],
            );

            match inserted {
                Ok(_) => Ok(record),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::DuplicateKey(key))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn update(&self, id: Uuid, update: &RecordUpdate) -> Result<ResolutionRecord, StoreError> {
        let update = update.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let mut record = select_by_id(&tx, id)?.ok_or(StoreError::NotFound(id))?;
            record
                .apply(&update)
                .map_err(|(from, to)| StoreError::InvalidTransition { from, to })?;

            tx.execute(
                "UPDATE resolution_records SET
                    title = ?2, duration_seconds = ?3, size_bytes = ?4, status = ?5,
                    resolved_url = ?6, archive_reference = ?7, error = ?8, resolved_at = ?9
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    record.title,
                    record.duration_seconds.map(|v| v as i64),
                    record.size_bytes.map(|v| v as i64),
                    record.status.as_str(),
                    record.resolved_url,
                    record.archive_reference,
                    record.error,
                    record.resolved_at.as_ref().map(timestamp),
                ],
            )?;
            tx.commit()?;

            Ok(record)
        })
        .await
    }

    async fn try_claim_promotion(&self, id: Uuid, lease: Duration) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let now = Utc::now();
            let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero());
            let cutoff = now - lease;

            let claimed = conn.execute(
                "UPDATE resolution_records SET promotion_claimed_at = ?2
                 WHERE id = ?1
                   AND archive_reference IS NULL
                   AND (promotion_claimed_at IS NULL OR promotion_claimed_at <= ?3)",
                params![id.to_string(), timestamp(&now), timestamp(&cutoff)],
            )?;

            if claimed == 0 && select_by_id(conn, id)?.is_none() {
                return Err(StoreError::NotFound(id));
            }
            Ok(claimed == 1)
        })
        .await
    }

    async fn reset_failed(&self, key: &ContentKey) -> Result<bool, StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM resolution_records
                 WHERE content_id = ?1 AND format = ?2 AND status = 'failed'",
                params![key.content_id(), key.format().as_str()],
            )?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn release_pending(&self, id: Uuid) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM resolution_records WHERE id = ?1 AND status = 'pending'",
                params![id.to_string()],
            )?;
            Ok(deleted > 0)
        })
        .await
    }
}
