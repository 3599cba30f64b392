//! Durable resolution records.
//!
//! A record is created `pending` by the first caller that misses every
//! faster tier and only ever moves forward from there.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::key::{ContentKey, Format};

/// Resolution status of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    /// An origin fetch has been started by some process
    Pending,

    /// A playable URL (and possibly an archive copy) exists
    Resolved,

    /// The origin reported the content missing or retries ran out
    Failed,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStatus::Pending => "pending",
            ResolutionStatus::Resolved => "resolved",
            ResolutionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ResolutionStatus::Pending),
            "resolved" => Some(ResolutionStatus::Resolved),
            "failed" => Some(ResolutionStatus::Failed),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` keeps the status monotonic.
    ///
    /// Staying put is allowed so metadata can be refreshed on a resolved
    /// record.
    pub fn can_transition_to(&self, next: ResolutionStatus) -> bool {
        matches!(
            (self, next),
            (ResolutionStatus::Pending, _)
                | (ResolutionStatus::Resolved, ResolutionStatus::Resolved)
                | (ResolutionStatus::Failed, ResolutionStatus::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResolutionStatus::Pending)
    }
}

impl std::fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of a content key's resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionRecord {
    pub id: Uuid,
    pub content_id: String,
    pub format: Format,
    pub title: Option<String>,
    pub duration_seconds: Option<u64>,
    pub size_bytes: Option<u64>,
    pub status: ResolutionStatus,

    /// Last URL handed out for this record (may have expired)
    pub resolved_url: Option<String>,

    /// Stable pointer into the archive, independent of any generated URL
    pub archive_reference: Option<String>,

    /// Reason for a `failed` status
    pub error: Option<String>,

    /// Set while some process holds the promotion lease
    pub promotion_claimed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ResolutionRecord {
    /// A fresh pending record for a key
    pub fn pending(key: &ContentKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            content_id: key.content_id().to_string(),
            format: key.format(),
            title: None,
            duration_seconds: None,
            size_bytes: None,
            status: ResolutionStatus::Pending,
            resolved_url: None,
            archive_reference: None,
            error: None,
            promotion_claimed_at: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn key(&self) -> ContentKey {
        ContentKey::new(self.content_id.clone(), self.format)
    }

    pub fn is_archived(&self) -> bool {
        self.archive_reference.is_some()
    }

    /// Apply an update in place, enforcing forward-only status changes.
    ///
    /// Returns the rejected `(from, to)` pair on a backward transition.
    pub fn apply(
        &mut self,
        update: &RecordUpdate,
    ) -> Result<(), (ResolutionStatus, ResolutionStatus)> {
        if let Some(next) = update.status {
            if !self.status.can_transition_to(next) {
                return Err((self.status, next));
            }
            if next == ResolutionStatus::Resolved && self.resolved_at.is_none() {
                self.resolved_at = Some(Utc::now());
            }
            self.status = next;
        }
        if let Some(ref title) = update.title {
            self.title = Some(title.clone());
        }
        if let Some(duration) = update.duration_seconds {
            self.duration_seconds = Some(duration);
        }
        if let Some(size) = update.size_bytes {
            self.size_bytes = Some(size);
        }
        if let Some(ref url) = update.resolved_url {
            self.resolved_url = Some(url.clone());
        }
        if let Some(ref reference) = update.archive_reference {
            self.archive_reference = Some(reference.clone());
        }
        if let Some(ref error) = update.error {
            self.error = Some(error.clone());
        }
        Ok(())
    }
}

/// Partial update applied through `PersistentStore::update`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordUpdate {
    pub status: Option<ResolutionStatus>,
    pub title: Option<String>,
    pub duration_seconds: Option<u64>,
    pub size_bytes: Option<u64>,
    pub resolved_url: Option<String>,
    pub archive_reference: Option<String>,
    pub error: Option<String>,
}

impl RecordUpdate {
    /// Mark resolved with a direct URL
    pub fn resolved(url: impl Into<String>) -> Self {
        Self {
            status: Some(ResolutionStatus::Resolved),
            resolved_url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Mark failed with a reason
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(ResolutionStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, title: impl Into<String>, duration_seconds: u64) -> Self {
        self.title = Some(title.into());
        self.duration_seconds = Some(duration_seconds);
        self
    }

    pub fn with_archive(mut self, reference: impl Into<String>, size_bytes: Option<u64>) -> Self {
        self.archive_reference = Some(reference.into());
        self.size_bytes = size_bytes;
        self
    }
}
