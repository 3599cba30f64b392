//! Promotion Integration Tests
//!
//! Background promotion copies origin results into the archive exactly
//! once, even when several services share the same store and archive.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{archive_url, fast_config, key, reference_for, service_with, FakeOrigin, MemoryArchive};
use tempfile::TempDir;
use tubecache::adapters::ContentMetadata;
use tubecache::core::{
    BackgroundPromoter, EventLog, MemoryCache, PromotionConfig, PromotionJob, PromotionOutcome,
};
use tubecache::domain::{ContentKey, EventType, Format, RecordUpdate, ResolutionSource};
use tubecache::store::{MemoryStore, PersistentStore};

fn promoter(
    store: Arc<MemoryStore>,
    archive: Arc<MemoryArchive>,
    origin: Arc<FakeOrigin>,
    cache: Arc<MemoryCache>,
    events: Option<EventLog>,
) -> BackgroundPromoter {
    BackgroundPromoter::spawn(
        &PromotionConfig::default(),
        fast_config().retry,
        store,
        archive,
        origin,
        cache,
        events,
    )
}

/// A resolved, unarchived record as the coordinator leaves it
async fn resolved_record(store: &MemoryStore, key: &ContentKey) -> uuid::Uuid {
    let record = store.create_pending(key).await.unwrap();
    store
        .update(
            record.id,
            &RecordUpdate::resolved("https://origin.test/direct").with_metadata("T", 180),
        )
        .await
        .unwrap();
    record.id
}

fn job(key: &ContentKey, record_id: uuid::Uuid, bytes: Option<Vec<u8>>) -> PromotionJob {
    PromotionJob {
        key: key.clone(),
        record_id,
        metadata: ContentMetadata {
            title: "T".to_string(),
            duration_seconds: 180,
        },
        bytes,
    }
}

#[tokio::test]
async fn origin_result_is_promoted_after_the_response() {
    let store = Arc::new(MemoryStore::new());
    let archive = Arc::new(MemoryArchive::new());
    let origin = Arc::new(FakeOrigin::new());
    origin.serve_url("K1", "T", 180);
    let service = service_with(fast_config(), store.clone(), archive.clone(), origin.clone(), None);
    let k1 = key("K1", Format::Audio);

    let resolution = service.resolve_key(&k1).await.unwrap();
    assert_eq!(resolution.source, ResolutionSource::Origin);

    // Shutdown drains the queued promotion
    service.shutdown().await;

    assert_eq!(archive.uploads(), 1);
    assert_eq!(origin.bytes_calls(), 1);
    assert_eq!(service.promotion_stats().promoted, 1);

    let record = store.find_by_key(&k1).await.unwrap().unwrap();
    assert_eq!(record.archive_reference, Some(reference_for(&k1)));
    assert_eq!(record.size_bytes, Some(1024));

    // The cache now points at the archive copy
    let cached = service.cache().get(&k1).unwrap();
    assert_eq!(cached.url, archive_url(&reference_for(&k1)));
}

#[tokio::test]
async fn concurrent_promoters_upload_once() {
    let store = Arc::new(MemoryStore::new());
    let archive = Arc::new(MemoryArchive::new().with_upload_delay(Duration::from_millis(50)));
    let origin = Arc::new(FakeOrigin::new());
    origin.serve_url("K1", "T", 180);
    let k1 = key("K1", Format::Audio);
    let record_id = resolved_record(&store, &k1).await;

    // Two processes, one store and one archive
    let first = promoter(
        store.clone(),
        archive.clone(),
        origin.clone(),
        Arc::new(MemoryCache::with_limits(10, Duration::from_secs(60))),
        None,
    );
    let second = promoter(
        store.clone(),
        archive.clone(),
        origin.clone(),
        Arc::new(MemoryCache::with_limits(10, Duration::from_secs(60))),
        None,
    );

    let (a, b) = tokio::join!(
        first.promote(job(&k1, record_id, Some(vec![1u8; 64]))),
        second.promote(job(&k1, record_id, Some(vec![1u8; 64]))),
    );

    let promoted = [&a, &b]
        .iter()
        .filter(|o| matches!(o, PromotionOutcome::Promoted { .. }))
        .count();
    assert_eq!(promoted, 1, "outcomes: {:?} / {:?}", a, b);
    assert!(
        matches!(a, PromotionOutcome::ClaimedElsewhere) || matches!(b, PromotionOutcome::ClaimedElsewhere)
    );
    assert_eq!(archive.uploads(), 1);

    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn services_sharing_a_store_upload_at_most_once() {
    let store = Arc::new(MemoryStore::new());
    let archive = Arc::new(MemoryArchive::new().with_upload_delay(Duration::from_millis(20)));
    let origin = Arc::new(FakeOrigin::new().with_delay(Duration::from_millis(50)));
    origin.serve_url("K1", "T", 180);

    let a = service_with(fast_config(), store.clone(), archive.clone(), origin.clone(), None);
    let b = service_with(fast_config(), store.clone(), archive.clone(), origin.clone(), None);
    let k1 = key("K1", Format::Audio);

    let (ra, rb) = tokio::join!(a.resolve_key(&k1), b.resolve_key(&k1));
    assert!(ra.is_ok());
    assert!(rb.is_ok());

    a.shutdown().await;
    b.shutdown().await;

    assert!(archive.uploads() <= 1);
    assert!(archive.contains(&k1));
}

#[tokio::test]
async fn archived_record_is_not_promoted_again() {
    let store = Arc::new(MemoryStore::new());
    let archive = Arc::new(MemoryArchive::new());
    let origin = Arc::new(FakeOrigin::new());
    let k1 = key("K1", Format::Audio);
    let record_id = resolved_record(&store, &k1).await;
    store
        .update(record_id, &RecordUpdate::default().with_archive("ref-existing", Some(10)))
        .await
        .unwrap();

    let promoter = promoter(
        store.clone(),
        archive.clone(),
        origin.clone(),
        Arc::new(MemoryCache::with_limits(10, Duration::from_secs(60))),
        None,
    );

    let outcome = promoter.promote(job(&k1, record_id, None)).await;
    assert_eq!(outcome, PromotionOutcome::AlreadyArchived);
    assert_eq!(archive.uploads(), 0);
    assert_eq!(origin.bytes_calls(), 0);
    assert_eq!(promoter.stats().skipped, 1);
}

#[tokio::test]
async fn copy_found_in_archive_is_recorded_instead_of_uploaded() {
    let store = Arc::new(MemoryStore::new());
    let archive = Arc::new(MemoryArchive::new());
    let origin = Arc::new(FakeOrigin::new());
    let k1 = key("K1", Format::Audio);
    let record_id = resolved_record(&store, &k1).await;
    let reference = archive.seed(&k1, "T", 180);
    let cache = Arc::new(MemoryCache::with_limits(10, Duration::from_secs(60)));

    let promoter = promoter(store.clone(), archive.clone(), origin.clone(), cache.clone(), None);

    let outcome = promoter.promote(job(&k1, record_id, None)).await;
    assert_eq!(outcome, PromotionOutcome::AlreadyArchived);
    assert_eq!(archive.uploads(), 0);

    let record = store.find_by_key(&k1).await.unwrap().unwrap();
    assert_eq!(record.archive_reference, Some(reference.clone()));
    assert_eq!(cache.get(&k1).unwrap().url, archive_url(&reference));
}

#[tokio::test]
async fn failed_promotion_is_logged_not_raised() {
    let temp = TempDir::new().unwrap();
    let events = EventLog::open(temp.path().join("events.jsonl")).await.unwrap();

    let store = Arc::new(MemoryStore::new());
    let archive = Arc::new(MemoryArchive::new());
    // Origin no longer knows the content, so the byte fetch fails
    let origin = Arc::new(FakeOrigin::new());
    let k9 = key("K9", Format::Audio);
    let record_id = resolved_record(&store, &k9).await;

    let promoter = promoter(
        store.clone(),
        archive.clone(),
        origin.clone(),
        Arc::new(MemoryCache::with_limits(10, Duration::from_secs(60))),
        Some(events.clone()),
    );

    let outcome = promoter.promote(job(&k9, record_id, None)).await;
    assert!(matches!(outcome, PromotionOutcome::Failed(_)));
    assert_eq!(promoter.stats().failed, 1);
    assert_eq!(archive.uploads(), 0);

    let logged = events
        .last_event_of_type(&k9, EventType::PromotionFailed)
        .await
        .unwrap()
        .unwrap();
    assert!(logged.error.is_some());

    // The record still resolves from its direct URL
    let record = store.find_by_key(&k9).await.unwrap().unwrap();
    assert!(record.archive_reference.is_none());
}

#[tokio::test]
async fn queued_jobs_finish_on_shutdown() {
    let store = Arc::new(MemoryStore::new());
    let archive = Arc::new(MemoryArchive::new().with_upload_delay(Duration::from_millis(20)));
    let origin = Arc::new(FakeOrigin::new());

    let promoter = promoter(
        store.clone(),
        archive.clone(),
        origin.clone(),
        Arc::new(MemoryCache::with_limits(10, Duration::from_secs(60))),
        None,
    );

    for id in ["A", "B", "C"] {
        origin.serve_url(id, id, 10);
        let k = key(id, Format::Audio);
        let record_id = resolved_record(&store, &k).await;
        assert!(promoter.submit(job(&k, record_id, None)));
    }

    promoter.shutdown().await;
    assert_eq!(archive.uploads(), 3);
    assert_eq!(promoter.stats().promoted, 3);

    // Closed promoters refuse new work
    let late = key("D", Format::Audio);
    assert!(!promoter.submit(job(&late, uuid::Uuid::new_v4(), None)));
}
