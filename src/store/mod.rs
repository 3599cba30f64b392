//! Durable resolution records.
//!
//! The store is the only component shared across processes, so it is the
//! only one that needs idempotent-write discipline: creation tolerates a
//! concurrent insert for the same key, and updates never move a status
//! backwards.

pub mod memory;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{ContentKey, RecordUpdate, ResolutionRecord, ResolutionStatus};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Errors that can occur in a record store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record already exists: {0}")]
    DuplicateKey(ContentKey),

    #[error("Record not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid status transition: {from} → {to}")]
    InvalidTransition {
        from: ResolutionStatus,
        to: ResolutionStatus,
    },

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Record store keyed by content key
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    async fn find_by_key(&self, key: &ContentKey) -> Result<Option<ResolutionRecord>, StoreError>;

    /// Insert a pending record; `DuplicateKey` if one already exists
    async fn insert_pending(&self, key: &ContentKey) -> Result<ResolutionRecord, StoreError>;

    /// Apply a partial update, rejecting backward status transitions
    async fn update(&self, id: Uuid, update: &RecordUpdate) -> Result<ResolutionRecord, StoreError>;

    /// Take the promotion lease for an unarchived record.
    ///
    /// Succeeds only if the record has no archive reference and nobody
    /// claimed it within `lease`.
    async fn try_claim_promotion(&self, id: Uuid, lease: Duration) -> Result<bool, StoreError>;

    /// Delete a `failed` record so the key can be resolved afresh.
    ///
    /// Returns false if there was no failed record for the key.
    async fn reset_failed(&self, key: &ContentKey) -> Result<bool, StoreError>;

    /// Delete a `pending` record its creator could not finish.
    ///
    /// Anyone waiting on it sees the row vanish and resolves afresh.
    /// Returns false if the record is no longer pending.
    async fn release_pending(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Create a pending record, or return the one a concurrent caller made
    async fn create_pending(&self, key: &ContentKey) -> Result<ResolutionRecord, StoreError> {
        match self.insert_pending(key).await {
            Err(StoreError::DuplicateKey(_)) => {
                debug!(key = %key, "Pending record created concurrently, re-reading");
                self.find_by_key(key).await?.ok_or_else(|| {
                    StoreError::Database(format!("record for {} vanished after duplicate insert", key))
                })
            }
            other => other,
        }
    }
}
