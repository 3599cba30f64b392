//! Adapter interfaces for external systems.
//!
//! The resolver talks to two slow collaborators: an archive that keeps
//! previously published copies, and the origin the content comes from.
//! Both sit behind traits so alternate backends (and test fakes) can be
//! substituted freely.

pub mod archive_index;
pub mod telegram;
pub mod ytdlp;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ContentKey, Format};

// Re-export the concrete adapters
pub use telegram::{TelegramArchive, TelegramConfig};
pub use ytdlp::YtDlpOrigin;

/// Title and length reported by the origin
#[derive(Debug, Clone, PartialEq)]
pub struct ContentMetadata {
    pub title: String,
    pub duration_seconds: u64,
}

/// What the origin handed back for a content request
#[derive(Debug, Clone, PartialEq)]
pub enum OriginPayload {
    /// The full media bytes
    Bytes(Vec<u8>),

    /// A URL the client can play directly
    DirectUrl(String),
}

/// Origin failures, classified for the retry policy
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OriginError {
    /// Content does not exist upstream (terminal)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Temporary provider failure
    #[error("Transient origin failure: {0}")]
    Transient(String),

    /// Provider asked us to slow down
    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Provider accepted the request but is still preparing the content
    #[error("Still processing: {0}")]
    Processing(String),
}

impl OriginError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, OriginError::NotFound(_))
    }
}

/// Slow path: acquire content from its original source
#[async_trait]
pub trait OriginFetchService: Send + Sync {
    /// Human-readable adapter name
    fn name(&self) -> &str;

    /// Look up title and duration
    async fn fetch_metadata(&self, content_id: &str) -> Result<ContentMetadata, OriginError>;

    /// Produce either the bytes or a directly playable URL
    async fn fetch_content_or_url(
        &self,
        content_id: &str,
        format: Format,
    ) -> Result<OriginPayload, OriginError>;

    /// Download the full bytes (used when only a URL is held)
    async fn fetch_bytes(&self, content_id: &str, format: Format) -> Result<Vec<u8>, OriginError>;
}

/// A previously published archive copy
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveHit {
    /// Stable reference; access URLs are derived from it on demand
    pub reference: String,
    pub title: String,
    pub duration_seconds: u64,
    pub size_bytes: Option<u64>,
}

/// Archive failures. None of these are fatal to a resolve.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive unavailable: {0}")]
    Unavailable(String),

    #[error("Archive rejected upload: {0}")]
    Rejected(String),

    #[error("Archive index error: {0}")]
    Index(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Independent archive of published copies
#[async_trait]
pub trait ArchiveSearch: Send + Sync {
    /// Human-readable adapter name
    fn name(&self) -> &str;

    /// Find a copy published by any process, now or in a prior run
    async fn find_existing(
        &self,
        content_id: &str,
        format: Format,
    ) -> Result<Option<ArchiveHit>, ArchiveError>;

    /// Derive a fresh, time-limited access URL from a reference
    async fn resolve_access_url(&self, reference: &str) -> Result<Option<String>, ArchiveError>;

    /// Publish bytes and return the new stable reference
    async fn publish(
        &self,
        key: &ContentKey,
        metadata: &ContentMetadata,
        bytes: Vec<u8>,
    ) -> Result<String, ArchiveError>;
}
