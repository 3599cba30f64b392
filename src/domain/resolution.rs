//! Resolution results and the public response shape.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::key::{ContentKey, Format};

/// Which tier satisfied a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Cache,
    Store,
    Archive,
    Origin,
}

impl std::fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResolutionSource::Cache => "cache",
            ResolutionSource::Store => "store",
            ResolutionSource::Archive => "archive",
            ResolutionSource::Origin => "origin",
        };
        f.write_str(s)
    }
}

/// A successfully resolved key
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub key: ContentKey,
    pub title: String,
    pub url: String,
    pub duration_seconds: u64,
    pub source: ResolutionSource,
}

/// Errors surfaced by `resolve`.
///
/// Cloneable so a single leader outcome can be handed to every follower
/// waiting on the same key.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Content not found: {key}")]
    NotFound { key: ContentKey, reason: String },

    #[error("Origin unavailable for {key} after {attempts} attempts: {reason}")]
    OriginTransient {
        key: ContentKey,
        attempts: u32,
        reason: String,
    },

    #[error("Origin rate limited {key} after {attempts} attempts")]
    OriginRateLimited { key: ContentKey, attempts: u32 },

    #[error("Archive unavailable: {0}")]
    ArchiveUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ResolveError {
    /// HTTP-equivalent status for the API layer
    pub fn http_status(&self) -> u16 {
        match self {
            ResolveError::InvalidRequest(_) => 400,
            ResolveError::NotFound { .. }
            | ResolveError::OriginTransient { .. }
            | ResolveError::OriginRateLimited { .. }
            | ResolveError::ArchiveUnavailable(_) => 404,
            ResolveError::Internal(_) => 500,
        }
    }

    /// Whether this outcome ends the record's life as `failed`
    pub fn is_terminal_for_record(&self) -> bool {
        matches!(
            self,
            ResolveError::NotFound { .. }
                | ResolveError::OriginTransient { .. }
                | ResolveError::OriginRateLimited { .. }
        )
    }
}

/// Wire response of the public resolve contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ResolveResponse {
    #[serde(rename_all = "camelCase")]
    Done {
        title: String,
        url: String,
        format: Format,
        duration_seconds: u64,
    },

    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        video_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        format: Option<Format>,
        #[serde(skip)]
        http_status: u16,
    },
}

impl ResolveResponse {
    pub fn is_done(&self) -> bool {
        matches!(self, ResolveResponse::Done { .. })
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ResolveResponse::Done { .. } => 200,
            ResolveResponse::Error { http_status, .. } => *http_status,
        }
    }

    /// Build an error response for a request that failed before a key existed
    pub fn invalid(message: impl Into<String>) -> Self {
        ResolveResponse::Error {
            message: message.into(),
            video_id: None,
            format: None,
            http_status: 400,
        }
    }

    pub fn from_result(key: &ContentKey, result: Result<Resolution, ResolveError>) -> Self {
        match result {
            Ok(resolution) => ResolveResponse::Done {
                title: resolution.title,
                url: resolution.url,
                format: resolution.key.format(),
                duration_seconds: resolution.duration_seconds,
            },
            Err(e) => ResolveResponse::Error {
                message: e.to_string(),
                video_id: Some(key.content_id().to_string()),
                format: Some(key.format()),
                http_status: e.http_status(),
            },
        }
    }
}
