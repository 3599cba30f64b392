//! Resolution events recorded in the append-only event log.
//!
//! Events are observability records, not state: the persistent store stays
//! authoritative. Each line answers "what happened to this key, and how
//! long did it take".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::key::{ContentKey, Format};

/// A single event in the resolution log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    pub content_id: String,
    pub format: Format,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary (no URLs, they are short-lived credentials)
    pub summary: String,

    /// Time taken in milliseconds
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl ResolutionEvent {
    /// Create a new event with the current timestamp
    pub fn new(key: &ContentKey, event_type: EventType, summary: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            content_id: key.content_id().to_string(),
            format: key.format(),
            event_type,
            summary: summary.into(),
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn key(&self) -> ContentKey {
        ContentKey::new(self.content_id.clone(), self.format)
    }
}

/// Types of resolution events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Served from the persistent store
    StoreHit,

    /// Served from an archive copy
    ArchiveHit,

    /// Resolved by a fresh origin fetch
    OriginResolved,

    /// Resolution failed; the record is now `failed`
    ResolutionFailed,

    /// Result copied into the archive
    Promoted,

    /// Promotion skipped (already archived or claimed elsewhere)
    PromotionSkipped,

    /// Promotion attempted and failed
    PromotionFailed,

    /// Failed record cleared by an operator
    Reset,
}
