//! yt-dlp origin adapter.
//!
//! Uses subprocess mode, calling the `yt-dlp` CLI directly. Timeouts are
//! owned by the caller's retry policy; children are killed when the
//! future driving them is dropped.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::{ContentMetadata, OriginError, OriginFetchService, OriginPayload};
use crate::domain::Format;

const DEFAULT_URL_TEMPLATE: &str = "https://www.youtube.com/watch?v={id}";

/// Origin adapter using the yt-dlp subprocess
pub struct YtDlpOrigin {
    /// Path to the yt-dlp binary (default: "yt-dlp")
    binary_path: String,
    /// Source page URL, `{id}` is replaced by the content id
    url_template: String,
    /// Extra arguments passed to every invocation (cookies, proxy, ...)
    extra_args: Vec<String>,
}

impl Default for YtDlpOrigin {
    fn default() -> Self {
        Self::new()
    }
}

/// Subset of `yt-dlp -J` output we care about
#[derive(Debug, Deserialize)]
struct VideoInfo {
    title: Option<String>,
    duration: Option<f64>,
}

impl YtDlpOrigin {
    /// Create an adapter with the default binary path
    pub fn new() -> Self {
        Self::with_binary_path("yt-dlp")
    }

    /// Create an adapter with a custom binary path
    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            url_template: DEFAULT_URL_TEMPLATE.to_string(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_url_template(mut self, template: impl Into<String>) -> Self {
        self.url_template = template.into();
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn source_url(&self, content_id: &str) -> String {
        self.url_template.replace("{id}", content_id)
    }

    fn format_selector(format: Format) -> &'static str {
        match format {
            Format::Audio => "bestaudio[ext=m4a]/bestaudio",
            Format::Video => "best[ext=mp4]/best",
        }
    }

    /// Run yt-dlp and return stdout, classifying failures
    async fn run(&self, content_id: &str, args: &[&str]) -> Result<Vec<u8>, OriginError> {
        let url = self.source_url(content_id);
        debug!(binary = %self.binary_path, ?args, url = %url, "Running yt-dlp");

        let output = Command::new(&self.binary_path)
            .args(&self.extra_args)
            .args(["--no-playlist", "--no-warnings"])
            .args(args)
            .arg("--")
            .arg(&url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| OriginError::Transient(format!("Failed to spawn yt-dlp: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(classify_failure(exit_code, stderr.trim()));
        }

        Ok(output.stdout)
    }
}

/// Map yt-dlp stderr to an origin error class
pub fn classify_failure(exit_code: i32, stderr: &str) -> OriginError {
    const GONE: &[&str] = &[
        "Video unavailable",
        "Private video",
        "This video has been removed",
        "This video is not available",
        "does not exist",
        "Incomplete YouTube ID",
        "is not a valid URL",
    ];
    const THROTTLED: &[&str] = &["HTTP Error 429", "Too Many Requests", "confirm you're not a bot"];
    const PREPARING: &[&str] = &["Premieres in", "live event will begin", "is not available yet"];

    let summary = stderr.lines().last().unwrap_or("").to_string();

    if GONE.iter().any(|m| stderr.contains(m)) {
        OriginError::NotFound(summary)
    } else if THROTTLED.iter().any(|m| stderr.contains(m)) {
        OriginError::RateLimited { retry_after: None }
    } else if PREPARING.iter().any(|m| stderr.contains(m)) {
        OriginError::Processing(summary)
    } else {
        OriginError::Transient(format!("yt-dlp exited with code {}: {}", exit_code, summary))
    }
}

#[async_trait]
impl OriginFetchService for YtDlpOrigin {
    fn name(&self) -> &str {
        "yt-dlp"
    }

    async fn fetch_metadata(&self, content_id: &str) -> Result<ContentMetadata, OriginError> {
        let stdout = self.run(content_id, &["-J", "--skip-download"]).await?;

        let info: VideoInfo = serde_json::from_slice(&stdout)
            .map_err(|e| OriginError::Transient(format!("Unreadable yt-dlp metadata: {}", e)))?;

        Ok(ContentMetadata {
            title: info.title.unwrap_or_else(|| content_id.to_string()),
            duration_seconds: info.duration.map(|d| d.max(0.0).round() as u64).unwrap_or(0),
        })
    }

    async fn fetch_content_or_url(
        &self,
        content_id: &str,
        format: Format,
    ) -> Result<OriginPayload, OriginError> {
        let stdout = self
            .run(content_id, &["-g", "-f", Self::format_selector(format)])
            .await?;

        let text = String::from_utf8_lossy(&stdout);
        let url = text
            .lines()
            .map(str::trim)
            .find(|l| l.starts_with("http"))
            .ok_or_else(|| OriginError::Transient("yt-dlp printed no URL".to_string()))?;

        Ok(OriginPayload::DirectUrl(url.to_string()))
    }

    async fn fetch_bytes(&self, content_id: &str, format: Format) -> Result<Vec<u8>, OriginError> {
        let bytes = self
            .run(content_id, &["-q", "-f", Self::format_selector(format), "-o", "-"])
            .await?;

        if bytes.is_empty() {
            return Err(OriginError::Transient("yt-dlp produced no data".to_string()));
        }
        Ok(bytes)
    }
}
