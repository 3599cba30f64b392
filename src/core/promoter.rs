//! Background promotion of origin results into the archive.
//!
//! After the coordinator has answered a request from the origin, it hands
//! the key to the promoter and moves on. A supervised worker receives jobs
//! over a channel and runs each one on its own task, so a slow upload
//! never holds up another key and never blocks a caller.
//!
//! Promotion is idempotent across processes: a job re-reads the record,
//! checks the archive, and only uploads after winning the store's
//! promotion lease.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cache::{CacheEntry, MemoryCache};
use super::event_log::EventLog;
use super::retry::RetryPolicy;
use crate::adapters::{ArchiveSearch, ContentMetadata, OriginFetchService};
use crate::domain::{ContentKey, EventType, RecordUpdate, ResolutionEvent, ResolutionStatus};
use crate::store::PersistentStore;

/// Promotion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionConfig {
    /// Promote origin results into the archive at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// How long a claim keeps other processes from promoting the same record
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,

    /// Jobs buffered before new ones are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_enabled() -> bool {
    true
}
fn default_lease_seconds() -> u64 {
    600
}
fn default_queue_capacity() -> usize {
    256
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            lease_seconds: default_lease_seconds(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl PromotionConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }
}

/// One key to promote
#[derive(Debug, Clone)]
pub struct PromotionJob {
    pub key: ContentKey,
    pub record_id: Uuid,
    pub metadata: ContentMetadata,

    /// Bytes already in hand; fetched from the origin when absent
    pub bytes: Option<Vec<u8>>,
}

/// How a job ended
#[derive(Debug, Clone, PartialEq)]
pub enum PromotionOutcome {
    /// Uploaded and recorded under this reference
    Promoted { reference: String },

    /// The record or the archive already had a copy
    AlreadyArchived,

    /// Another process holds the promotion lease
    ClaimedElsewhere,

    /// Logged and dropped
    Failed(String),
}

/// Outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromotionStats {
    pub promoted: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Everything a job needs, shared by the worker and its tasks
struct PromotionContext {
    store: Arc<dyn PersistentStore>,
    archive: Arc<dyn ArchiveSearch>,
    origin: Arc<dyn OriginFetchService>,
    cache: Arc<MemoryCache>,
    events: Option<EventLog>,
    retry: RetryPolicy,
    lease: Duration,
    promoted: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Handle to the promotion worker
pub struct BackgroundPromoter {
    context: Arc<PromotionContext>,
    tx: Mutex<Option<mpsc::Sender<PromotionJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundPromoter {
    /// Start the worker. Must be called from within a Tokio runtime.
    pub fn spawn(
        config: &PromotionConfig,
        retry: RetryPolicy,
        store: Arc<dyn PersistentStore>,
        archive: Arc<dyn ArchiveSearch>,
        origin: Arc<dyn OriginFetchService>,
        cache: Arc<MemoryCache>,
        events: Option<EventLog>,
    ) -> Self {
        let context = Arc::new(PromotionContext {
            store,
            archive,
            origin,
            cache,
            events,
            retry,
            lease: config.lease(),
            promoted: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let (tx, worker) = if config.enabled {
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
            let worker = tokio::spawn(run_worker(Arc::clone(&context), rx));
            (Some(tx), Some(worker))
        } else {
            debug!("Promotion disabled");
            (None, None)
        };

        Self {
            context,
            tx: Mutex::new(tx),
            worker: Mutex::new(worker),
        }
    }

    /// Queue a job without waiting. Returns false if it was dropped.
    pub fn submit(&self, job: PromotionJob) -> bool {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            debug!(key = %job.key, "Promoter not running, skipping promotion");
            return false;
        };

        match tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(key = %job.key, "Promotion queue full, dropping job");
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                debug!(key = %job.key, "Promotion queue closed, dropping job");
                false
            }
        }
    }

    /// Run a job on the caller's task and return its outcome
    pub async fn promote(&self, job: PromotionJob) -> PromotionOutcome {
        self.context.run(job).await
    }

    pub fn stats(&self) -> PromotionStats {
        PromotionStats {
            promoted: self.context.promoted.load(Ordering::Relaxed),
            skipped: self.context.skipped.load(Ordering::Relaxed),
            failed: self.context.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting jobs and wait for the ones already queued or running
    pub async fn shutdown(&self) {
        // Dropping the sender ends the worker's receive loop
        drop(self.tx.lock().take());

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Promotion worker ended abnormally");
            }
        }
    }
}

async fn run_worker(context: Arc<PromotionContext>, mut rx: mpsc::Receiver<PromotionJob>) {
    let mut jobs = JoinSet::new();

    loop {
        tokio::select! {
            job = rx.recv() => match job {
                Some(job) => {
                    let context = Arc::clone(&context);
                    jobs.spawn(async move { context.run(job).await });
                }
                None => break,
            },
            Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "Promotion task panicked");
                }
            }
        }
    }

    // Drain what is still running
    while let Some(joined) = jobs.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Promotion task panicked");
        }
    }
    debug!("Promotion worker stopped");
}

impl PromotionContext {
    async fn run(&self, job: PromotionJob) -> PromotionOutcome {
        let start = Instant::now();
        let key = job.key.clone();

        let outcome = match self.promote(job).await {
            Ok(outcome) => outcome,
            Err(reason) => PromotionOutcome::Failed(reason),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let event = match &outcome {
            PromotionOutcome::Promoted { reference } => {
                self.promoted.fetch_add(1, Ordering::Relaxed);
                info!(key = %key, event = "promoted", duration_ms, "Promoted to archive");
                ResolutionEvent::new(&key, EventType::Promoted, format!("archived as {}", reference))
                    .with_duration(duration_ms)
            }
            PromotionOutcome::AlreadyArchived => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Already archived, promotion skipped");
                ResolutionEvent::new(&key, EventType::PromotionSkipped, "already archived")
                    .with_duration(duration_ms)
            }
            PromotionOutcome::ClaimedElsewhere => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Promotion claimed by another process");
                ResolutionEvent::new(&key, EventType::PromotionSkipped, "claimed elsewhere")
                    .with_duration(duration_ms)
            }
            PromotionOutcome::Failed(reason) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %reason, "Promotion failed");
                ResolutionEvent::new(&key, EventType::PromotionFailed, "promotion failed")
                    .with_duration(duration_ms)
                    .with_error(reason.clone())
            }
        };

        if let Some(events) = &self.events {
            events.append_or_warn(&event).await;
        }
        outcome
    }

    async fn promote(&self, job: PromotionJob) -> Result<PromotionOutcome, String> {
        let PromotionJob {
            key,
            record_id,
            metadata,
            bytes,
        } = job;

        let record = self
            .store
            .find_by_key(&key)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("record for {} vanished", key))?;

        if record.id != record_id {
            return Err(format!("record for {} was replaced", key));
        }
        if record.is_archived() {
            return Ok(PromotionOutcome::AlreadyArchived);
        }
        if record.status != ResolutionStatus::Resolved {
            return Err(format!("record is {}, not resolved", record.status));
        }

        // Another process may have published without updating our store
        match self.archive.find_existing(key.content_id(), key.format()).await {
            Ok(Some(hit)) => {
                let update = RecordUpdate::default().with_archive(hit.reference.clone(), hit.size_bytes);
                self.store
                    .update(record.id, &update)
                    .await
                    .map_err(|e| e.to_string())?;
                self.refresh_cache(&key, &metadata, &hit.reference).await;
                return Ok(PromotionOutcome::AlreadyArchived);
            }
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "Archive search failed, promoting anyway"),
        }

        let claimed = self
            .store
            .try_claim_promotion(record.id, self.lease)
            .await
            .map_err(|e| e.to_string())?;
        if !claimed {
            return Ok(PromotionOutcome::ClaimedElsewhere);
        }

        let bytes = match bytes {
            Some(bytes) => bytes,
            None => {
                let origin = &self.origin;
                let content_id = key.content_id();
                let format = key.format();
                self.retry
                    .run(&key, "fetch_bytes", move || origin.fetch_bytes(content_id, format))
                    .await
                    .map_err(|e| e.to_string())?
            }
        };
        let size_bytes = bytes.len() as u64;

        let reference = self
            .archive
            .publish(&key, &metadata, bytes)
            .await
            .map_err(|e| e.to_string())?;

        let update = RecordUpdate::default().with_archive(reference.clone(), Some(size_bytes));
        self.store
            .update(record.id, &update)
            .await
            .map_err(|e| e.to_string())?;

        self.refresh_cache(&key, &metadata, &reference).await;
        Ok(PromotionOutcome::Promoted { reference })
    }

    /// Replace the cached origin URL with one served by the archive
    async fn refresh_cache(&self, key: &ContentKey, metadata: &ContentMetadata, reference: &str) {
        match self.archive.resolve_access_url(reference).await {
            Ok(Some(url)) => {
                self.cache.set(
                    key.clone(),
                    CacheEntry::new(metadata.title.clone(), url, metadata.duration_seconds, key.format()),
                );
            }
            Ok(None) => debug!(key = %key, "Archive has no access URL yet"),
            Err(e) => warn!(key = %key, error = %e, "Failed to regenerate archive URL"),
        }
    }
}
