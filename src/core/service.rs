//! Request coordinator: the public `resolve` contract.
//!
//! A request walks the tiers from fastest to slowest and stops at the
//! first one that yields a usable URL:
//!
//! 1. memory cache
//! 2. in-flight registry (join a leader already working on the key)
//! 3. persistent store (including a bounded wait on another process's
//!    `pending` record)
//! 4. archive search
//! 5. origin fetch, followed by background promotion
//!
//! A tier that errors is logged and skipped; only running out of tiers
//! produces an error for the caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::cache::{CacheConfig, CacheEntry, MemoryCache};
use super::event_log::EventLog;
use super::inflight::{Acquired, FollowerOutcome, InFlightConfig, InFlightRegistry};
use super::poll::{PendingPoll, PollConfig, PollStep};
use super::promoter::{BackgroundPromoter, PromotionConfig, PromotionJob, PromotionStats};
use super::retry::RetryPolicy;
use crate::adapters::{ArchiveSearch, ContentMetadata, OriginFetchService, OriginPayload};
use crate::domain::{
    ContentKey, EventType, Format, RecordUpdate, Resolution, ResolutionEvent, ResolutionRecord,
    ResolutionSource, ResolutionStatus, ResolveError, ResolveResponse,
};
use crate::store::{PersistentStore, StoreError};

/// Tuning for every tier the coordinator owns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub inflight: InFlightConfig,

    #[serde(default)]
    pub poll: PollConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub promotion: PromotionConfig,

    /// How long a stored direct origin URL is trusted
    #[serde(default = "default_direct_url_ttl")]
    pub direct_url_ttl_seconds: u64,
}

fn default_direct_url_ttl() -> u64 {
    4 * 60 * 60
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            inflight: InFlightConfig::default(),
            poll: PollConfig::default(),
            retry: RetryPolicy::default(),
            promotion: PromotionConfig::default(),
            direct_url_ttl_seconds: default_direct_url_ttl(),
        }
    }
}

/// Outcome of waiting on a record another process is resolving
enum PendingWait {
    /// It finished while we waited
    Settled(ResolutionRecord),

    /// Stop waiting and resolve ourselves, reusing the record if any
    TakeOver(Option<ResolutionRecord>),
}

/// Outcome of trying to create the `pending` record ourselves
enum PendingClaim {
    /// We own the new record
    Created(ResolutionRecord),

    /// Another process created it first
    Existing(ResolutionRecord),

    /// The store is unusable; continue without a record
    Unrecorded,
}

/// Tiered resolver owning the cache, the in-flight registry and the promoter
pub struct ResolutionService {
    config: ServiceConfig,
    cache: Arc<MemoryCache>,
    registry: InFlightRegistry,
    store: Arc<dyn PersistentStore>,
    archive: Arc<dyn ArchiveSearch>,
    origin: Arc<dyn OriginFetchService>,
    events: Option<EventLog>,
    promoter: BackgroundPromoter,
}

impl ResolutionService {
    /// Build the service and start its promotion worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn PersistentStore>,
        archive: Arc<dyn ArchiveSearch>,
        origin: Arc<dyn OriginFetchService>,
        events: Option<EventLog>,
    ) -> Self {
        let cache = Arc::new(MemoryCache::new(&config.cache));
        let registry = InFlightRegistry::new(config.leader_budget());
        let promoter = BackgroundPromoter::spawn(
            &config.promotion,
            config.retry.clone(),
            Arc::clone(&store),
            Arc::clone(&archive),
            Arc::clone(&origin),
            Arc::clone(&cache),
            events.clone(),
        );

        info!(
            store = store.name(),
            archive = archive.name(),
            origin = origin.name(),
            cache_capacity = config.cache.capacity,
            "Resolution service started"
        );

        Self {
            config,
            cache,
            registry,
            store,
            archive,
            origin,
            events,
            promoter,
        }
    }

    pub fn cache(&self) -> &MemoryCache {
        &self.cache
    }

    pub fn registry(&self) -> &InFlightRegistry {
        &self.registry
    }

    pub fn promoter(&self) -> &BackgroundPromoter {
        &self.promoter
    }

    pub fn promotion_stats(&self) -> PromotionStats {
        self.promoter.stats()
    }

    /// Resolve a request given as raw strings into its wire response
    pub async fn resolve(&self, content_id: &str, format: &str) -> ResolveResponse {
        let format: Format = match format.parse() {
            Ok(format) => format,
            Err(e) => return ResolveResponse::invalid(e.to_string()),
        };
        let key = ContentKey::new(content_id, format);
        if let Err(reason) = key.validate() {
            return ResolveResponse::invalid(reason);
        }

        let result = self.resolve_key(&key).await;
        ResolveResponse::from_result(&key, result)
    }

    /// Resolve a typed key, reporting which tier answered
    #[instrument(skip_all, fields(key = %key))]
    pub async fn resolve_key(&self, key: &ContentKey) -> Result<Resolution, ResolveError> {
        key.validate().map_err(ResolveError::InvalidRequest)?;

        if let Some(hit) = self.cached(key) {
            return Ok(hit);
        }

        let mut follower_retries = 0u32;
        loop {
            match self.registry.acquire(key) {
                Acquired::Leader(guard) => {
                    let outcome = self.lead(key).await;
                    guard.release(outcome.clone());
                    return outcome;
                }
                Acquired::Follower(follower) => match follower.wait().await {
                    FollowerOutcome::Completed(outcome) => return outcome,
                    lost => {
                        follower_retries += 1;
                        if follower_retries > self.config.inflight.max_follower_retries {
                            error!(key = %key, retries = follower_retries - 1, "Gave up waiting for in-flight resolution");
                            return Err(ResolveError::Internal(format!(
                                "in-flight resolution for {} did not complete",
                                key
                            )));
                        }
                        debug!(key = %key, outcome = ?lost, attempt = follower_retries, "Leader lost, re-acquiring");
                        if let Some(hit) = self.cached(key) {
                            return Ok(hit);
                        }
                    }
                },
            }
        }
    }

    /// Stop the promoter after its queued jobs finish
    pub async fn shutdown(&self) {
        self.promoter.shutdown().await;
        info!("Resolution service stopped");
    }

    fn cached(&self, key: &ContentKey) -> Option<Resolution> {
        self.cache.get(key).map(|entry| {
            debug!(key = %key, "Cache hit");
            Resolution {
                key: key.clone(),
                title: entry.title,
                url: entry.url,
                duration_seconds: entry.duration_seconds,
                source: ResolutionSource::Cache,
            }
        })
    }

    /// Leader path: everything below the cache
    async fn lead(&self, key: &ContentKey) -> Result<Resolution, ResolveError> {
        // A previous leader may have filled the cache since our miss
        if let Some(hit) = self.cached(key) {
            return Ok(hit);
        }

        let start = Instant::now();
        let result = self.resolve_uncached(key).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(resolution) => {
                info!(key = %key, source = %resolution.source, duration_ms, "Resolved");
            }
            Err(e) => {
                info!(key = %key, duration_ms, error = %e, "Resolution failed");
            }
        }
        result
    }

    async fn resolve_uncached(&self, key: &ContentKey) -> Result<Resolution, ResolveError> {
        let mut record = self.find_record(key).await;
        let mut lost_create_race = false;

        loop {
            if let Some(found) = record.take() {
                let found = if found.status == ResolutionStatus::Pending {
                    match self.await_pending(key, found).await {
                        PendingWait::Settled(settled) => Some(settled),
                        PendingWait::TakeOver(latest) => latest,
                    }
                } else {
                    Some(found)
                };

                record = match found {
                    Some(r) if r.status == ResolutionStatus::Failed => {
                        debug!(key = %key, "Record is failed");
                        return Err(ResolveError::NotFound {
                            key: key.clone(),
                            reason: r.error.unwrap_or_else(|| "previously failed".to_string()),
                        });
                    }
                    Some(r) if r.status == ResolutionStatus::Resolved => match self.serve_record(key, &r).await {
                        Some(resolution) => return Ok(resolution),
                        None => Some(r),
                    },
                    other => other,
                };
            }

            if let Some(resolution) = self.from_archive(key, record.as_ref()).await {
                return Ok(resolution);
            }

            let owned = match record.take() {
                Some(r) => Some(r),
                None => match self.claim_pending(key).await {
                    PendingClaim::Created(r) => Some(r),
                    // Someone else won the insert: wait on their record once
                    PendingClaim::Existing(r) if !lost_create_race => {
                        lost_create_race = true;
                        record = Some(r);
                        continue;
                    }
                    PendingClaim::Existing(r) => Some(r),
                    PendingClaim::Unrecorded => None,
                },
            };

            return self.from_origin(key, owned).await;
        }
    }

    async fn find_record(&self, key: &ContentKey) -> Option<ResolutionRecord> {
        match self.store.find_by_key(key).await {
            Ok(record) => record,
            Err(e) => {
                warn!(key = %key, error = %e, "Store lookup failed, skipping tier");
                None
            }
        }
    }

    /// Insert our own `pending` record, or learn who beat us to it
    async fn claim_pending(&self, key: &ContentKey) -> PendingClaim {
        match self.store.insert_pending(key).await {
            Ok(record) => PendingClaim::Created(record),
            Err(StoreError::DuplicateKey(_)) => match self.store.find_by_key(key).await {
                Ok(Some(record)) => {
                    debug!(key = %key, status = %record.status, "Record created concurrently elsewhere");
                    PendingClaim::Existing(record)
                }
                Ok(None) => {
                    warn!(key = %key, "Record vanished after duplicate insert, continuing unrecorded");
                    PendingClaim::Unrecorded
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Store lookup failed, continuing unrecorded");
                    PendingClaim::Unrecorded
                }
            },
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to create pending record, continuing unrecorded");
                PendingClaim::Unrecorded
            }
        }
    }

    /// Poll a `pending` record owned by someone else until it settles
    async fn await_pending(&self, key: &ContentKey, first: ResolutionRecord) -> PendingWait {
        let mut poll = PendingPoll::new(&self.config.poll);
        let mut latest = Some(first);

        loop {
            match poll.observe(latest.as_ref()) {
                PollStep::Wait(delay) => {
                    debug!(key = %key, attempt = poll.attempt(), delay_ms = delay.as_millis() as u64, "Record pending elsewhere, waiting");
                    tokio::time::sleep(delay).await;
                    match self.store.find_by_key(key).await {
                        Ok(record) => latest = record,
                        // Keep the last good read and try again next round
                        Err(e) => warn!(key = %key, error = %e, "Store poll failed"),
                    }
                }
                PollStep::Settled(record) => {
                    debug!(key = %key, status = %record.status, attempts = poll.attempt(), "Pending record settled");
                    return PendingWait::Settled(record);
                }
                PollStep::Exhausted => {
                    warn!(key = %key, attempts = poll.attempt(), "Pending record never settled, resolving ourselves");
                    return PendingWait::TakeOver(latest);
                }
                PollStep::Orphaned => {
                    warn!(key = %key, "Pending record is stale, resolving ourselves");
                    return PendingWait::TakeOver(latest);
                }
                PollStep::Vanished => {
                    info!(key = %key, "Pending record was removed, resolving afresh");
                    return PendingWait::TakeOver(None);
                }
            }
        }
    }

    /// Answer from a resolved record, if it still points somewhere playable
    async fn serve_record(&self, key: &ContentKey, record: &ResolutionRecord) -> Option<Resolution> {
        let title = record.title.clone().unwrap_or_else(|| key.content_id().to_string());
        let duration_seconds = record.duration_seconds.unwrap_or(0);

        if let Some(reference) = &record.archive_reference {
            match self.archive.resolve_access_url(reference).await {
                Ok(Some(url)) => {
                    self.emit(ResolutionEvent::new(key, EventType::StoreHit, "archived record")).await;
                    return Some(self.finish(key, title, url, duration_seconds, ResolutionSource::Store));
                }
                Ok(None) => debug!(key = %key, "Archive reference no longer yields a URL"),
                Err(e) => warn!(key = %key, error = %e, "Failed to regenerate archive URL"),
            }
        }

        if let (Some(url), Some(resolved_at)) = (&record.resolved_url, record.resolved_at) {
            let ttl = chrono::Duration::from_std(self.config.direct_url_ttl()).unwrap_or_else(|_| chrono::Duration::zero());
            if Utc::now() - resolved_at < ttl {
                self.emit(ResolutionEvent::new(key, EventType::StoreHit, "direct URL")).await;
                return Some(self.finish(key, title, url.clone(), duration_seconds, ResolutionSource::Store));
            }
            debug!(key = %key, "Stored direct URL is stale");
        }

        None
    }

    /// Look for a copy published by any process, now or earlier
    async fn from_archive(&self, key: &ContentKey, record: Option<&ResolutionRecord>) -> Option<Resolution> {
        let hit = match self.archive.find_existing(key.content_id(), key.format()).await {
            Ok(Some(hit)) => hit,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %ResolveError::ArchiveUnavailable(e.to_string()), "Archive search failed, skipping tier");
                return None;
            }
        };

        let url = match self.archive.resolve_access_url(&hit.reference).await {
            Ok(Some(url)) => url,
            Ok(None) => {
                debug!(key = %key, "Archive copy has no access URL");
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to regenerate archive URL");
                return None;
            }
        };

        let update = RecordUpdate {
            status: Some(ResolutionStatus::Resolved),
            ..Default::default()
        }
        .with_metadata(hit.title.clone(), hit.duration_seconds)
        .with_archive(hit.reference.clone(), hit.size_bytes);

        let record_id = match record {
            Some(r) => Some(r.id),
            None => match self.store.create_pending(key).await {
                Ok(r) => Some(r.id),
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to record archive hit");
                    None
                }
            },
        };
        if let Some(id) = record_id {
            if let Err(e) = self.store.update(id, &update).await {
                warn!(key = %key, error = %e, "Failed to record archive hit");
            }
        }

        self.emit(ResolutionEvent::new(key, EventType::ArchiveHit, "found in archive")).await;
        Some(self.finish(key, hit.title, url, hit.duration_seconds, ResolutionSource::Archive))
    }

    /// Slow path: fetch from the origin, answer, then promote
    async fn from_origin(
        &self,
        key: &ContentKey,
        record: Option<ResolutionRecord>,
    ) -> Result<Resolution, ResolveError> {
        let start = Instant::now();

        let origin = &self.origin;
        let content_id = key.content_id();
        let format = key.format();

        let metadata = match self
            .config
            .retry
            .run(key, "fetch_metadata", move || origin.fetch_metadata(content_id))
            .await
        {
            Ok(metadata) => metadata,
            Err(e) => return Err(self.fail(key, record.as_ref(), e).await),
        };

        let payload = match self
            .config
            .retry
            .run(key, "fetch_content_or_url", move || {
                origin.fetch_content_or_url(content_id, format)
            })
            .await
        {
            Ok(payload) => payload,
            Err(e) => return Err(self.fail(key, record.as_ref(), e).await),
        };

        let resolution = match payload {
            OriginPayload::DirectUrl(url) => {
                if let Some(r) = &record {
                    let update = RecordUpdate::resolved(url.clone())
                        .with_metadata(metadata.title.clone(), metadata.duration_seconds);
                    if let Err(e) = self.store.update(r.id, &update).await {
                        warn!(key = %key, error = %e, "Failed to mark record resolved");
                    }
                }

                let resolution = self.finish(
                    key,
                    metadata.title.clone(),
                    url,
                    metadata.duration_seconds,
                    ResolutionSource::Origin,
                );

                if let Some(r) = &record {
                    self.promoter.submit(PromotionJob {
                        key: key.clone(),
                        record_id: r.id,
                        metadata,
                        bytes: None,
                    });
                }
                resolution
            }
            OriginPayload::Bytes(bytes) => match self.publish_inline(key, record.as_ref(), metadata, bytes).await {
                Ok(resolution) => resolution,
                Err(e) => {
                    self.abandon(key, record.as_ref(), &e).await;
                    return Err(e);
                }
            },
        };

        self.emit(
            ResolutionEvent::new(key, EventType::OriginResolved, "resolved from origin")
                .with_duration(start.elapsed().as_millis() as u64),
        )
        .await;
        Ok(resolution)
    }

    /// Bytes have no URL of their own; the archive has to serve them now
    async fn publish_inline(
        &self,
        key: &ContentKey,
        record: Option<&ResolutionRecord>,
        metadata: ContentMetadata,
        bytes: Vec<u8>,
    ) -> Result<Resolution, ResolveError> {
        let size_bytes = bytes.len() as u64;

        let reference = self
            .archive
            .publish(key, &metadata, bytes)
            .await
            .map_err(|e| ResolveError::ArchiveUnavailable(e.to_string()))?;

        let url = match self.archive.resolve_access_url(&reference).await {
            Ok(Some(url)) => url,
            Ok(None) => {
                return Err(ResolveError::ArchiveUnavailable(format!(
                    "published copy {} has no access URL",
                    reference
                )))
            }
            Err(e) => return Err(ResolveError::ArchiveUnavailable(e.to_string())),
        };

        if let Some(r) = record {
            let update = RecordUpdate::resolved(url.clone())
                .with_metadata(metadata.title.clone(), metadata.duration_seconds)
                .with_archive(reference, Some(size_bytes));
            if let Err(e) = self.store.update(r.id, &update).await {
                warn!(key = %key, error = %e, "Failed to mark record resolved");
            }
        }

        Ok(self.finish(
            key,
            metadata.title,
            url,
            metadata.duration_seconds,
            ResolutionSource::Origin,
        ))
    }

    /// Give up a record we could not finish so nobody waits on it
    async fn abandon(&self, key: &ContentKey, record: Option<&ResolutionRecord>, error: &ResolveError) {
        warn!(key = %key, error = %error, "Could not serve origin bytes, releasing pending record");

        if let Some(r) = record {
            match self.store.release_pending(r.id).await {
                Ok(true) => {}
                Ok(false) => debug!(key = %key, "Record settled before release"),
                Err(e) => warn!(key = %key, error = %e, "Failed to release pending record"),
            }
        }

        self.emit(
            ResolutionEvent::new(key, EventType::ResolutionFailed, "archive publish failed")
                .with_error(error.to_string()),
        )
        .await;
    }

    /// Record a terminal origin failure and hand the error back
    async fn fail(&self, key: &ContentKey, record: Option<&ResolutionRecord>, error: ResolveError) -> ResolveError {
        error!(key = %key, error = %error, "Origin resolution failed");

        if error.is_terminal_for_record() {
            if let Some(r) = record {
                if let Err(e) = self.store.update(r.id, &RecordUpdate::failed(error.to_string())).await {
                    warn!(key = %key, error = %e, "Failed to mark record failed");
                }
            }
        }

        self.emit(
            ResolutionEvent::new(key, EventType::ResolutionFailed, "origin resolution failed")
                .with_error(error.to_string()),
        )
        .await;
        error
    }

    /// Build the answer and remember it in the cache
    fn finish(
        &self,
        key: &ContentKey,
        title: String,
        url: String,
        duration_seconds: u64,
        source: ResolutionSource,
    ) -> Resolution {
        let resolution = Resolution {
            key: key.clone(),
            title,
            url,
            duration_seconds,
            source,
        };
        self.cache.set(key.clone(), CacheEntry::from_resolution(&resolution));
        resolution
    }

    async fn emit(&self, event: ResolutionEvent) {
        if let Some(events) = &self.events {
            events.append_or_warn(&event).await;
        }
    }
}

impl ServiceConfig {
    pub fn direct_url_ttl(&self) -> Duration {
        Duration::from_secs(self.direct_url_ttl_seconds)
    }

    /// How long a live leader may hold its ticket: one pending wait, two
    /// retried origin calls, and the in-flight slack for everything else
    pub fn leader_budget(&self) -> Duration {
        let pending_wait = Duration::from_millis(self.poll.interval_ms) * self.poll.max_attempts;
        pending_wait + self.retry.max_elapsed() * 2 + self.inflight.ticket_timeout()
    }
}
