//! In-process record store.
//!
//! Suitable for a single resolver process; records are lost on restart.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{PersistentStore, StoreError};
use crate::domain::{ContentKey, RecordUpdate, ResolutionRecord, ResolutionStatus};

/// HashMap-backed store
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<ContentKey, ResolutionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly (used to model state left by a prior run)
    pub fn insert(&self, record: ResolutionRecord) {
        self.records.lock().insert(record.key(), record);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn find_by_key(&self, key: &ContentKey) -> Result<Option<ResolutionRecord>, StoreError> {
        Ok(self.records.lock().get(key).cloned())
    }

    async fn insert_pending(&self, key: &ContentKey) -> Result<ResolutionRecord, StoreError> {
        let mut records = self.records.lock();
        if records.contains_key(key) {
            return Err(StoreError::DuplicateKey(key.clone()));
        }
        let record = ResolutionRecord::pending(key);
        records.insert(key.clone(), record.clone());
        Ok(record)
    }

    async fn update(&self, id: Uuid, update: &RecordUpdate) -> Result<ResolutionRecord, StoreError> {
        let mut records = self.records.lock();
        let record = records
            .values_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))?;

        record
            .apply(update)
            .map_err(|(from, to)| StoreError::InvalidTransition { from, to })?;
        Ok(record.clone())
    }

    async fn try_claim_promotion(&self, id: Uuid, lease: Duration) -> Result<bool, StoreError> {
        let mut records = self.records.lock();
        let record = records
            .values_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))?;

        if record.archive_reference.is_some() {
            return Ok(false);
        }

        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero());
        let free = match record.promotion_claimed_at {
            Some(claimed) => now - claimed >= lease,
            None => true,
        };
        if free {
            record.promotion_claimed_at = Some(now);
        }
        Ok(free)
    }

    async fn reset_failed(&self, key: &ContentKey) -> Result<bool, StoreError> {
        let mut records = self.records.lock();
        match records.get(key) {
            Some(r) if r.status == ResolutionStatus::Failed => {
                records.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_pending(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut records = self.records.lock();
        let key = records
            .iter()
            .find(|(_, r)| r.id == id && r.status == ResolutionStatus::Pending)
            .map(|(k, _)| k.clone());
        Ok(key.map_or(false, |k| records.remove(&k).is_some()))
    }
}
