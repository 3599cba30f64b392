//! Append-only resolution event log with file-based persistence.
//!
//! Events are stored as newline-delimited JSON (JSONL) for simplicity
//! and easy debugging/inspection. The log is observability only; the
//! record store remains the source of truth.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::domain::{ContentKey, EventType, ResolutionEvent};

/// File-based event log using JSONL format
#[derive(Debug, Clone)]
pub struct EventLog {
    /// Path to the events.jsonl file
    events_path: PathBuf,
}

impl EventLog {
    /// Open (creating the parent directory) an event log at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let events_path = path.into();
        if let Some(parent) = events_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create event log directory: {}", parent.display()))?;
        }
        Ok(Self { events_path })
    }

    /// Open the log at the configured default location
    pub async fn open_default() -> Result<Self> {
        Self::open(crate::config::events_path()?).await
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Append an event to the log under an exclusive file lock
    pub async fn append(&self, event: &ResolutionEvent) -> Result<()> {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        let path = self.events_path.clone();

        tokio::task::spawn_blocking(move || append_locked(&path, &json))
            .await
            .context("Event log task failed")?
    }

    /// Append, logging instead of failing; the log never decides an outcome
    pub async fn append_or_warn(&self, event: &ResolutionEvent) {
        if let Err(e) = self.append(event).await {
            tracing::warn!(
                path = %self.events_path.display(),
                error = %e,
                "Failed to append resolution event"
            );
        }
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<ResolutionEvent>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: ResolutionEvent = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Most recent `limit` events, optionally for one key, oldest first
    pub async fn tail(&self, key: Option<&ContentKey>, limit: usize) -> Result<Vec<ResolutionEvent>> {
        let events = self.replay().await?;
        let mut matching: Vec<ResolutionEvent> = events
            .into_iter()
            .filter(|e| key.map_or(true, |k| e.content_id == k.content_id() && e.format == k.format()))
            .collect();

        let skip = matching.len().saturating_sub(limit);
        Ok(matching.split_off(skip))
    }

    /// Get the last event of a specific type for a key
    pub async fn last_event_of_type(
        &self,
        key: &ContentKey,
        event_type: EventType,
    ) -> Result<Option<ResolutionEvent>> {
        let events = self.replay().await?;
        Ok(events
            .into_iter()
            .rev()
            .find(|e| e.event_type == event_type && &e.key() == key))
    }
}

/// Other processes share the file, so every line goes in under `flock`
fn append_locked(path: &Path, line: &str) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open events file: {}", path.display()))?;
    file.lock_exclusive()
        .with_context(|| format!("Failed to lock events file: {}", path.display()))?;

    writeln!(file, "{}", line).context("Failed to write event")?;
    file.flush().context("Failed to flush event")?;

    // Lock is released when file is dropped
    Ok(())
}
