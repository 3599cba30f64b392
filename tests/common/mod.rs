//! Shared fakes for integration tests.
//!
//! `FakeOrigin` and `MemoryArchive` count every call so tests can assert
//! how often the slow tiers were touched.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use tubecache::adapters::{
    ArchiveError, ArchiveHit, ArchiveSearch, ContentMetadata, OriginError, OriginFetchService, OriginPayload,
};
use tubecache::core::{EventLog, ServiceConfig};
use tubecache::domain::{ContentKey, Format};
use tubecache::store::PersistentStore;
use tubecache::ResolutionService;

/// What the fake origin does for a content id
#[derive(Debug, Clone)]
pub enum Behavior {
    Url { title: String, duration: u64 },
    Bytes { title: String, duration: u64 },
}

/// Scriptable origin; unknown ids are `NotFound`
#[derive(Default)]
pub struct FakeOrigin {
    behaviors: Mutex<HashMap<String, Behavior>>,
    /// Errors returned by the next content fetches, front first
    scripted: Mutex<HashMap<String, VecDeque<OriginError>>>,
    content_delay: Duration,
    metadata_calls: AtomicUsize,
    content_calls: AtomicUsize,
    bytes_calls: AtomicUsize,
}

impl FakeOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every content fetch takes this long
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.content_delay = delay;
        self
    }

    pub fn serve_url(&self, content_id: &str, title: &str, duration: u64) {
        self.behaviors.lock().insert(
            content_id.to_string(),
            Behavior::Url {
                title: title.to_string(),
                duration,
            },
        );
    }

    pub fn serve_bytes(&self, content_id: &str, title: &str, duration: u64) {
        self.behaviors.lock().insert(
            content_id.to_string(),
            Behavior::Bytes {
                title: title.to_string(),
                duration,
            },
        );
    }

    /// Fail the next content fetches for `content_id` with these errors
    pub fn fail_next(&self, content_id: &str, errors: Vec<OriginError>) {
        self.scripted
            .lock()
            .entry(content_id.to_string())
            .or_default()
            .extend(errors);
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    pub fn content_calls(&self) -> usize {
        self.content_calls.load(Ordering::SeqCst)
    }

    pub fn bytes_calls(&self) -> usize {
        self.bytes_calls.load(Ordering::SeqCst)
    }

    fn behavior(&self, content_id: &str) -> Result<Behavior, OriginError> {
        self.behaviors
            .lock()
            .get(content_id)
            .cloned()
            .ok_or_else(|| OriginError::NotFound(format!("Video unavailable: {}", content_id)))
    }
}

pub fn origin_url(content_id: &str, format: Format) -> String {
    format!("https://origin.test/{}/{}", content_id, format)
}

#[async_trait]
impl OriginFetchService for FakeOrigin {
    fn name(&self) -> &str {
        "fake-origin"
    }

    async fn fetch_metadata(&self, content_id: &str) -> Result<ContentMetadata, OriginError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior(content_id)? {
            Behavior::Url { title, duration } | Behavior::Bytes { title, duration } => Ok(ContentMetadata {
                title,
                duration_seconds: duration,
            }),
        }
    }

    async fn fetch_content_or_url(&self, content_id: &str, format: Format) -> Result<OriginPayload, OriginError> {
        self.content_calls.fetch_add(1, Ordering::SeqCst);
        if !self.content_delay.is_zero() {
            tokio::time::sleep(self.content_delay).await;
        }

        let scripted = self
            .scripted
            .lock()
            .get_mut(content_id)
            .and_then(|queue| queue.pop_front());
        if let Some(error) = scripted {
            return Err(error);
        }

        match self.behavior(content_id)? {
            Behavior::Url { .. } => Ok(OriginPayload::DirectUrl(origin_url(content_id, format))),
            Behavior::Bytes { .. } => Ok(OriginPayload::Bytes(vec![7u8; 2048])),
        }
    }

    async fn fetch_bytes(&self, content_id: &str, _format: Format) -> Result<Vec<u8>, OriginError> {
        self.bytes_calls.fetch_add(1, Ordering::SeqCst);
        self.behavior(content_id)?;
        Ok(vec![7u8; 1024])
    }
}

/// In-memory archive with an upload counter
#[derive(Default)]
pub struct MemoryArchive {
    copies: Mutex<HashMap<ContentKey, ArchiveHit>>,
    upload_delay: Duration,
    search_delay: Duration,
    unavailable: AtomicBool,
    publish_failing: AtomicBool,
    uploads: AtomicUsize,
    searches: AtomicUsize,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every publish takes this long
    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = delay;
        self
    }

    /// Every search takes this long
    pub fn with_search_delay(mut self, delay: Duration) -> Self {
        self.search_delay = delay;
        self
    }

    /// Place a copy as if an earlier run had published it
    pub fn seed(&self, key: &ContentKey, title: &str, duration: u64) -> String {
        let reference = reference_for(key);
        self.copies.lock().insert(
            key.clone(),
            ArchiveHit {
                reference: reference.clone(),
                title: title.to_string(),
                duration_seconds: duration,
                size_bytes: Some(4096),
            },
        );
        reference
    }

    /// Make every search fail
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make every publish fail
    pub fn set_publish_failing(&self, failing: bool) {
        self.publish_failing.store(failing, Ordering::SeqCst);
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &ContentKey) -> bool {
        self.copies.lock().contains_key(key)
    }
}

pub fn reference_for(key: &ContentKey) -> String {
    format!("ref-{}-{}", key.content_id(), key.format())
}

pub fn archive_url(reference: &str) -> String {
    format!("https://archive.test/file/{}", reference)
}

#[async_trait]
impl ArchiveSearch for MemoryArchive {
    fn name(&self) -> &str {
        "memory-archive"
    }

    async fn find_existing(&self, content_id: &str, format: Format) -> Result<Option<ArchiveHit>, ArchiveError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if !self.search_delay.is_zero() {
            tokio::time::sleep(self.search_delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ArchiveError::Unavailable("archive offline".to_string()));
        }
        Ok(self
            .copies
            .lock()
            .get(&ContentKey::new(content_id, format))
            .cloned())
    }

    async fn resolve_access_url(&self, reference: &str) -> Result<Option<String>, ArchiveError> {
        Ok(Some(archive_url(reference)))
    }

    async fn publish(
        &self,
        key: &ContentKey,
        metadata: &ContentMetadata,
        bytes: Vec<u8>,
    ) -> Result<String, ArchiveError> {
        if !self.upload_delay.is_zero() {
            tokio::time::sleep(self.upload_delay).await;
        }
        if self.publish_failing.load(Ordering::SeqCst) {
            return Err(ArchiveError::Unavailable("upload refused".to_string()));
        }
        self.uploads.fetch_add(1, Ordering::SeqCst);

        let reference = reference_for(key);
        self.copies.lock().insert(
            key.clone(),
            ArchiveHit {
                reference: reference.clone(),
                title: metadata.title.clone(),
                duration_seconds: metadata.duration_seconds,
                size_bytes: Some(bytes.len() as u64),
            },
        );
        Ok(reference)
    }
}

/// Tier settings with short waits so tests finish quickly
pub fn fast_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.retry.max_attempts = 3;
    config.retry.initial_delay_ms = 10;
    config.retry.max_delay_ms = 50;
    config.retry.attempt_timeout_seconds = 5;
    config.poll.interval_ms = 20;
    config.poll.max_attempts = 10;
    config.inflight.ticket_timeout_seconds = 5;
    config
}

pub fn service_with(
    config: ServiceConfig,
    store: Arc<dyn PersistentStore>,
    archive: Arc<MemoryArchive>,
    origin: Arc<FakeOrigin>,
    events: Option<EventLog>,
) -> ResolutionService {
    ResolutionService::new(config, store, archive, origin, events)
}

pub fn key(content_id: &str, format: Format) -> ContentKey {
    ContentKey::new(content_id, format)
}
