//! Record Store Integration Tests
//!
//! Exercises the SQLite store the way several resolver processes would:
//! separate connections on one database file.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tempfile::TempDir;
use tubecache::domain::{ContentKey, Format, RecordUpdate, ResolutionStatus};
use tubecache::store::{PersistentStore, SqliteStore, StoreError};

fn k1() -> ContentKey {
    ContentKey::new("K1", Format::Audio)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_create_pending_converges_on_one_record() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("records.db");

    let stores: Vec<Arc<SqliteStore>> = (0..4)
        .map(|_| Arc::new(SqliteStore::open(&path).unwrap()))
        .collect();

    let tasks = stores.iter().map(|store| {
        let store = Arc::clone(store);
        tokio::spawn(async move { store.create_pending(&k1()).await })
    });
    let records: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let first = records[0].id;
    assert!(records.iter().all(|r| r.id == first));
    assert!(records.iter().all(|r| r.status == ResolutionStatus::Pending));
}

#[tokio::test]
async fn status_only_moves_forward() {
    let temp = TempDir::new().unwrap();
    let store = SqliteStore::open(&temp.path().join("records.db")).unwrap();

    let record = store.create_pending(&k1()).await.unwrap();
    let resolved = store
        .update(record.id, &RecordUpdate::resolved("https://cdn.test/a").with_metadata("T", 180))
        .await
        .unwrap();
    assert_eq!(resolved.status, ResolutionStatus::Resolved);
    assert!(resolved.resolved_at.is_some());

    let err = store
        .update(record.id, &RecordUpdate::failed("late failure"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::InvalidTransition {
            from: ResolutionStatus::Resolved,
            to: ResolutionStatus::Failed,
        }
    ));

    // Metadata can still be refreshed without a status change
    let archived = store
        .update(record.id, &RecordUpdate::default().with_archive("file-1", Some(99)))
        .await
        .unwrap();
    assert_eq!(archived.status, ResolutionStatus::Resolved);
    assert_eq!(archived.archive_reference.as_deref(), Some("file-1"));
    assert_eq!(archived.title.as_deref(), Some("T"));
}

#[tokio::test]
async fn promotion_claim_is_exclusive_across_connections() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("records.db");
    let a = SqliteStore::open(&path).unwrap();
    let b = SqliteStore::open(&path).unwrap();

    let record = a.create_pending(&k1()).await.unwrap();
    a.update(record.id, &RecordUpdate::resolved("https://cdn.test/a"))
        .await
        .unwrap();

    let lease = Duration::from_secs(600);
    assert!(a.try_claim_promotion(record.id, lease).await.unwrap());
    assert!(!b.try_claim_promotion(record.id, lease).await.unwrap());
    assert!(!a.try_claim_promotion(record.id, lease).await.unwrap());

    // A zero lease is always expired
    assert!(b.try_claim_promotion(record.id, Duration::ZERO).await.unwrap());
}

#[tokio::test]
async fn claim_on_unknown_record_is_an_error() {
    let store = SqliteStore::open_in_memory().unwrap();
    let err = store
        .try_claim_promotion(uuid::Uuid::new_v4(), Duration::from_secs(60))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
async fn reset_reopens_a_failed_key() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("records.db");
    let store = SqliteStore::open(&path).unwrap();

    let record = store.create_pending(&k1()).await.unwrap();
    store
        .update(record.id, &RecordUpdate::failed("Video unavailable"))
        .await
        .unwrap();

    // Another process sees the reset
    let other = SqliteStore::open(&path).unwrap();
    assert!(other.reset_failed(&k1()).await.unwrap());
    assert!(store.find_by_key(&k1()).await.unwrap().is_none());

    let fresh = store.create_pending(&k1()).await.unwrap();
    assert_ne!(fresh.id, record.id);
    assert_eq!(fresh.status, ResolutionStatus::Pending);
}
