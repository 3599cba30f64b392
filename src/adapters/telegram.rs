//! Telegram Bot API as a content archive.
//!
//! Published copies are uploaded to a private channel with `sendAudio` or
//! `sendVideo`. The returned `file_id` is the stable archive reference;
//! playable URLs are derived from it with `getFile` and expire after about
//! an hour, so they are never stored.
//!
//! Bot API download URLs embed the bot token. Handing one to a client gives
//! away the bot, so access URLs are only produced under a configured
//! `public_file_base`: a token-free host that serves the `file_path` values
//! `getFile` returns (a file proxy or a self-hosted Bot API server's file
//! directory). Without one the archive still publishes and indexes copies
//! but cannot serve them.
//!
//! The Bot API cannot search a channel, so uploads are also written to an
//! [`ArchiveIndex`] which `find_existing` consults.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::archive_index::{ArchiveIndex, IndexEntry};
use super::{ArchiveError, ArchiveHit, ArchiveSearch, ContentMetadata};
use crate::domain::{ContentKey, Format};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Telegram archive backed by a bot and a channel
pub struct TelegramArchive {
    /// Bot token
    bot_token: String,
    /// Archive channel ID
    chat_id: String,
    /// API root, overridable for self-hosted Bot API servers
    api_base: String,
    /// Token-free root serving `getFile` paths
    public_file_base: Option<String>,
    /// HTTP client
    client: reqwest::Client,
    /// Local index of published copies
    index: ArchiveIndex,
}

/// Response envelope from Telegram API
#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

/// Message result from sendAudio/sendVideo
#[derive(Debug, Deserialize)]
struct MessageResult {
    message_id: i64,
    audio: Option<FileRef>,
    video: Option<FileRef>,
    // Large or odd containers come back as documents
    document: Option<FileRef>,
}

#[derive(Debug, Deserialize)]
struct FileRef {
    file_id: String,
    file_size: Option<u64>,
}

/// Result of getFile
#[derive(Debug, Deserialize)]
struct FileResult {
    file_path: Option<String>,
}

/// Configuration for the Telegram archive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,

    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Root that serves `getFile` paths without the token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_file_base: Option<String>,

    /// Upload/request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_request_timeout() -> u64 {
    300
}

impl TelegramArchive {
    /// Create a new Telegram archive
    pub fn new(bot_token: String, chat_id: String, index_path: PathBuf) -> Self {
        Self {
            bot_token,
            chat_id,
            api_base: default_api_base(),
            public_file_base: None,
            client: reqwest::Client::new(),
            index: ArchiveIndex::new(index_path),
        }
    }

    /// Create from config
    pub fn from_config(config: TelegramConfig, index_path: PathBuf) -> Result<Self, ArchiveError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| ArchiveError::Unavailable(format!("Failed to build HTTP client: {}", e)))?;

        let public_file_base = config.public_file_base.filter(|base| !base.trim().is_empty());
        if public_file_base.is_none() {
            warn!("No public_file_base configured; archived copies will not be served");
        }

        Ok(Self {
            bot_token: config.bot_token,
            chat_id: config.chat_id,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            public_file_base: public_file_base.map(|base| base.trim_end_matches('/').to_string()),
            client,
            index: ArchiveIndex::new(index_path),
        })
    }

    /// Point the archive at another Bot API server
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Serve archived copies from a token-free file root
    pub fn with_public_file_base(mut self, base: impl Into<String>) -> Self {
        self.public_file_base = Some(base.into().trim_end_matches('/').to_string());
        self
    }

    pub fn index(&self) -> &ArchiveIndex {
        &self.index
    }

    /// Build API URL
    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    /// Client-facing URL for a file path returned by getFile
    fn public_file_url(&self, file_path: &str) -> Option<String> {
        self.public_file_base
            .as_ref()
            .map(|base| format!("{}/{}", base, file_path.trim_start_matches('/')))
    }

    fn caption(key: &ContentKey, metadata: &ContentMetadata) -> String {
        format!(
            "{}\n#{} #{}",
            metadata.title,
            key.content_id().replace('-', "_"),
            key.format()
        )
    }

    async fn upload(
        &self,
        key: &ContentKey,
        metadata: &ContentMetadata,
        bytes: Vec<u8>,
    ) -> Result<MessageResult, ArchiveError> {
        let (method, field, file_name, mime) = match key.format() {
            Format::Audio => ("sendAudio", "audio", format!("{}.m4a", key.content_id()), "audio/mp4"),
            Format::Video => ("sendVideo", "video", format!("{}.mp4", key.content_id()), "video/mp4"),
        };

        let file_part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime)
            .map_err(|e| ArchiveError::Rejected(format!("Invalid mime type: {}", e)))?;

        let mut form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("caption", Self::caption(key, metadata))
            .text("duration", metadata.duration_seconds.to_string())
            .part(field, file_part);

        if key.format() == Format::Audio {
            form = form.text("title", metadata.title.clone());
        } else {
            form = form.text("supports_streaming", "true");
        }

        let response = self
            .client
            .post(self.api_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                ArchiveError::Unavailable(format!("Failed to send Telegram {}: {}", field, e.without_url()))
            })?;

        let result: TelegramResponse<MessageResult> = response
            .json()
            .await
            .map_err(|e| {
                ArchiveError::Unavailable(format!("Failed to parse Telegram response: {}", e.without_url()))
            })?;

        if !result.ok {
            return Err(ArchiveError::Rejected(format!(
                "Telegram API error: {}",
                result.description.unwrap_or_default()
            )));
        }

        result
            .result
            .ok_or_else(|| ArchiveError::Rejected("Telegram returned no message".to_string()))
    }
}

#[async_trait]
impl ArchiveSearch for TelegramArchive {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn find_existing(
        &self,
        content_id: &str,
        format: Format,
    ) -> Result<Option<ArchiveHit>, ArchiveError> {
        let entry = self.index.find(content_id, format).await?;
        Ok(entry.map(|e| ArchiveHit {
            reference: e.reference,
            title: e.title,
            duration_seconds: e.duration_seconds,
            size_bytes: e.size_bytes,
        }))
    }

    async fn resolve_access_url(&self, reference: &str) -> Result<Option<String>, ArchiveError> {
        if self.public_file_base.is_none() {
            debug!(reference, "No public file base; archive copy not servable");
            return Ok(None);
        }

        let response = self
            .client
            .post(self.api_url("getFile"))
            .json(&serde_json::json!({ "file_id": reference }))
            .send()
            .await
            .map_err(|e| ArchiveError::Unavailable(format!("Failed to call getFile: {}", e.without_url())))?;

        let result: TelegramResponse<FileResult> = response
            .json()
            .await
            .map_err(|e| {
                ArchiveError::Unavailable(format!("Failed to parse Telegram response: {}", e.without_url()))
            })?;

        if !result.ok {
            // Files over the Bot API download limit, or references from
            // another bot, cannot be served from here
            debug!(
                reference,
                description = result.description.as_deref().unwrap_or(""),
                "getFile refused reference"
            );
            return Ok(None);
        }

        Ok(result
            .result
            .and_then(|f| f.file_path)
            .and_then(|path| self.public_file_url(&path)))
    }

    async fn publish(
        &self,
        key: &ContentKey,
        metadata: &ContentMetadata,
        bytes: Vec<u8>,
    ) -> Result<String, ArchiveError> {
        let uploaded_bytes = bytes.len() as u64;
        let message = self.upload(key, metadata, bytes).await?;

        let file = message
            .audio
            .or(message.video)
            .or(message.document)
            .ok_or_else(|| ArchiveError::Rejected("Telegram message carries no file".to_string()))?;

        let entry = IndexEntry {
            timestamp: Utc::now(),
            content_id: key.content_id().to_string(),
            format: key.format(),
            reference: file.file_id.clone(),
            title: metadata.title.clone(),
            duration_seconds: metadata.duration_seconds,
            size_bytes: file.file_size.or(Some(uploaded_bytes)),
            message_id: Some(message.message_id),
        };

        // The upload already happened; an index failure only costs a future
        // re-upload, so report it without failing the publish
        if let Err(e) = self.index.append(entry).await {
            warn!(key = %key, error = %e, "Failed to index archive upload");
        }

        info!(key = %key, message_id = message.message_id, "Published to Telegram archive");
        Ok(file.file_id)
    }
}
