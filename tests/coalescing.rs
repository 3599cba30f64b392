//! Cross-process coalescing through the persistent store.
//!
//! A second process that finds a `pending` record waits for it instead of
//! fetching from the origin again, unless the record looks abandoned.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{archive_url, fast_config, key, origin_url, reference_for, service_with, FakeOrigin, MemoryArchive};
use tempfile::TempDir;
use tubecache::core::{EventLog, ServiceConfig};
use tubecache::domain::{EventType, Format, RecordUpdate, ResolutionRecord, ResolutionSource, ResolutionStatus};
use tubecache::store::{MemoryStore, PersistentStore};

#[tokio::test]
async fn waits_for_a_record_resolved_elsewhere() {
    let store = Arc::new(MemoryStore::new());
    let origin = Arc::new(FakeOrigin::new());
    let k1 = key("K1", Format::Audio);

    // Another process has claimed the key and is still fetching
    let pending = store.create_pending(&k1).await.unwrap();
    let other = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            store
                .update(
                    pending.id,
                    &RecordUpdate::resolved("https://elsewhere.test/K1").with_metadata("T", 180),
                )
                .await
                .unwrap();
        })
    };

    let service = service_with(fast_config(), store.clone(), Arc::new(MemoryArchive::new()), origin.clone(), None);
    let resolution = service.resolve_key(&k1).await.unwrap();
    other.await.unwrap();

    assert_eq!(resolution.source, ResolutionSource::Store);
    assert_eq!(resolution.url, "https://elsewhere.test/K1");
    assert_eq!(resolution.title, "T");
    assert_eq!(origin.metadata_calls(), 0);
    assert_eq!(origin.content_calls(), 0);
}

#[tokio::test]
async fn stale_pending_record_is_taken_over() {
    let store = Arc::new(MemoryStore::new());
    let origin = Arc::new(FakeOrigin::new());
    origin.serve_url("K1", "T", 180);
    let k1 = key("K1", Format::Audio);

    let mut orphan = ResolutionRecord::pending(&k1);
    orphan.created_at = Utc::now() - chrono::Duration::hours(1);
    let orphan_id = orphan.id;
    store.insert(orphan);

    let mut config = fast_config();
    config.promotion.enabled = false;
    let service = service_with(config, store.clone(), Arc::new(MemoryArchive::new()), origin.clone(), None);

    let resolution = service.resolve_key(&k1).await.unwrap();
    assert_eq!(resolution.source, ResolutionSource::Origin);
    assert_eq!(resolution.url, origin_url("K1", Format::Audio));
    assert_eq!(origin.content_calls(), 1);

    // The orphaned row was completed rather than replaced
    let record = store.find_by_key(&k1).await.unwrap().unwrap();
    assert_eq!(record.id, orphan_id);
    assert_eq!(record.status, ResolutionStatus::Resolved);
}

#[tokio::test]
async fn pending_that_never_settles_is_taken_over() {
    let store = Arc::new(MemoryStore::new());
    let origin = Arc::new(FakeOrigin::new());
    origin.serve_url("K1", "T", 180);
    let k1 = key("K1", Format::Audio);
    store.create_pending(&k1).await.unwrap();

    let mut config = fast_config();
    config.promotion.enabled = false;
    config.poll.interval_ms = 5;
    config.poll.max_attempts = 3;
    let service = service_with(config, store.clone(), Arc::new(MemoryArchive::new()), origin.clone(), None);

    let resolution = service.resolve_key(&k1).await.unwrap();
    assert_eq!(resolution.source, ResolutionSource::Origin);
    assert_eq!(origin.content_calls(), 1);
}

#[tokio::test]
async fn reset_lets_a_failed_key_resolve_again() {
    let temp = TempDir::new().unwrap();
    let events = EventLog::open(temp.path().join("events.jsonl")).await.unwrap();
    let store = Arc::new(MemoryStore::new());
    let origin = Arc::new(FakeOrigin::new());
    let k1 = key("K1", Format::Audio);

    let mut config = fast_config();
    config.promotion.enabled = false;
    let service = service_with(
        config,
        store.clone(),
        Arc::new(MemoryArchive::new()),
        origin.clone(),
        Some(events.clone()),
    );

    // Unknown upstream: the record fails
    assert_eq!(service.resolve("K1", "audio").await.http_status(), 404);
    let failed = events
        .last_event_of_type(&k1, EventType::ResolutionFailed)
        .await
        .unwrap();
    assert!(failed.is_some());

    // Content appears upstream, but the failure sticks until reset
    origin.serve_url("K1", "T", 180);
    assert_eq!(service.resolve("K1", "audio").await.http_status(), 404);
    assert_eq!(origin.content_calls(), 0);

    assert!(store.reset_failed(&k1).await.unwrap());
    let response = service.resolve("K1", "audio").await;
    assert!(response.is_done(), "unexpected response: {:?}", response);
    assert_eq!(origin.content_calls(), 1);

    let history = events.tail(Some(&k1), 10).await.unwrap();
    let types: Vec<EventType> = history.iter().map(|e| e.event_type).collect();
    assert_eq!(types, vec![EventType::ResolutionFailed, EventType::OriginResolved]);
}

#[tokio::test]
async fn store_hits_are_logged() {
    let temp = TempDir::new().unwrap();
    let events = EventLog::open(temp.path().join("events.jsonl")).await.unwrap();
    let store = Arc::new(MemoryStore::new());
    let origin = Arc::new(FakeOrigin::new());
    origin.serve_url("K1", "T", 180);
    let k1 = key("K1", Format::Audio);

    let mut config = fast_config();
    config.promotion.enabled = false;

    // First process resolves from the origin
    let first = service_with(
        config.clone(),
        store.clone(),
        Arc::new(MemoryArchive::new()),
        origin.clone(),
        Some(events.clone()),
    );
    first.resolve_key(&k1).await.unwrap();

    // Second process has a cold cache and reads the record
    let second = service_with(
        config,
        store.clone(),
        Arc::new(MemoryArchive::new()),
        origin.clone(),
        Some(events.clone()),
    );
    let resolution = second.resolve_key(&k1).await.unwrap();
    assert_eq!(resolution.source, ResolutionSource::Store);

    let last = events.tail(Some(&k1), 1).await.unwrap();
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].event_type, EventType::StoreHit);
    assert!(!last[0].summary.contains("https://"));
}

#[tokio::test]
async fn simultaneous_first_requests_fetch_once() {
    let store = Arc::new(MemoryStore::new());
    // Both processes miss the store and are still searching the archive
    // when the first one creates the record
    let archive = Arc::new(MemoryArchive::new().with_search_delay(Duration::from_millis(30)));
    let origin = Arc::new(FakeOrigin::new().with_delay(Duration::from_millis(100)));
    origin.serve_url("K1", "T", 180);
    let k1 = key("K1", Format::Audio);

    let mut config = fast_config();
    config.promotion.enabled = false;
    config.poll.max_attempts = 50;
    let a = service_with(config.clone(), store.clone(), archive.clone(), origin.clone(), None);
    let b = service_with(config, store.clone(), archive.clone(), origin.clone(), None);

    let (ra, rb) = tokio::join!(a.resolve_key(&k1), b.resolve_key(&k1));
    let ra = ra.unwrap();
    let rb = rb.unwrap();

    assert_eq!(ra.url, origin_url("K1", Format::Audio));
    assert_eq!(rb.url, ra.url);
    let sources = [ra.source, rb.source];
    assert!(sources.contains(&ResolutionSource::Origin));
    assert!(sources.contains(&ResolutionSource::Store));
    assert_eq!(origin.content_calls(), 1);
    assert_eq!(origin.metadata_calls(), 1);

    let record = store.find_by_key(&k1).await.unwrap().unwrap();
    assert_eq!(record.status, ResolutionStatus::Resolved);
}

#[tokio::test]
async fn failed_publish_releases_the_pending_record() {
    let temp = TempDir::new().unwrap();
    let events = EventLog::open(temp.path().join("events.jsonl")).await.unwrap();
    let store = Arc::new(MemoryStore::new());
    let archive = Arc::new(MemoryArchive::new());
    archive.set_publish_failing(true);
    let origin = Arc::new(FakeOrigin::new());
    origin.serve_bytes("K1", "T", 180);
    let k1 = key("K1", Format::Audio);

    let config = ServiceConfig::default();
    let poll_interval = Duration::from_millis(config.poll.interval_ms);
    let service = service_with(config, store.clone(), archive.clone(), origin.clone(), Some(events.clone()));

    assert_eq!(service.resolve("K1", "audio").await.http_status(), 404);
    assert!(store.find_by_key(&k1).await.unwrap().is_none());
    let failed = events
        .last_event_of_type(&k1, EventType::ResolutionFailed)
        .await
        .unwrap()
        .unwrap();
    assert!(failed.error.is_some());

    // Once the archive recovers the next request fetches straight away
    archive.set_publish_failing(false);
    let start = std::time::Instant::now();
    let response = service.resolve("K1", "audio").await;
    assert!(response.is_done(), "unexpected response: {:?}", response);
    assert!(start.elapsed() < poll_interval);
    assert_eq!(origin.content_calls(), 2);

    let record = store.find_by_key(&k1).await.unwrap().unwrap();
    assert_eq!(record.status, ResolutionStatus::Resolved);
    assert_eq!(record.archive_reference, Some(reference_for(&k1)));
    assert_eq!(service.cache().get(&k1).unwrap().url, archive_url(&reference_for(&k1)));

    service.shutdown().await;
}
