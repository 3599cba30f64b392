//! Append-only JSONL index of archive uploads.
//!
//! The archive itself cannot be searched by content id, so every upload
//! appends one line mapping `(content_id, format)` to its stable
//! reference. The index belongs to the archive, not the record store: a
//! fresh store can still find copies published in an earlier life.
//!
//! Writers take an exclusive `fs2` lock so several processes can share the
//! file; the last matching line wins on lookup.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::ArchiveError;
use crate::domain::Format;

/// One published copy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub timestamp: DateTime<Utc>,
    pub content_id: String,
    pub format: Format,

    /// Stable archive reference (for Telegram, the `file_id`)
    pub reference: String,

    pub title: String,
    pub duration_seconds: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,

    /// Channel message carrying the upload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
}

/// File-backed archive index
#[derive(Debug, Clone)]
pub struct ArchiveIndex {
    path: PathBuf,
}

impl ArchiveIndex {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a published copy
    pub async fn append(&self, entry: IndexEntry) -> Result<(), ArchiveError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || append_locked(&path, &entry))
            .await
            .map_err(|e| ArchiveError::Index(format!("index task failed: {}", e)))?
    }

    /// Latest published copy for a key, if any
    pub async fn find(
        &self,
        content_id: &str,
        format: Format,
    ) -> Result<Option<IndexEntry>, ArchiveError> {
        let path = self.path.clone();
        let content_id = content_id.to_string();
        tokio::task::spawn_blocking(move || find_locked(&path, &content_id, format))
            .await
            .map_err(|e| ArchiveError::Index(format!("index task failed: {}", e)))?
    }
}

fn append_locked(path: &Path, entry: &IndexEntry) -> Result<(), ArchiveError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.lock_exclusive()?;

    let json = serde_json::to_string(entry)
        .map_err(|e| ArchiveError::Index(format!("Failed to serialize entry: {}", e)))?;
    writeln!(file, "{}", json)?;
    file.flush()?;

    // Lock is released when file is dropped
    Ok(())
}

fn find_locked(path: &Path, content_id: &str, format: Format) -> Result<Option<IndexEntry>, ArchiveError> {
    if !path.exists() {
        return Ok(None);
    }

    let file = File::open(path)?;
    file.lock_shared()?;

    let mut found = None;
    for line in BufReader::new(&file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        // A torn or foreign line should not hide the rest of the index
        let entry: IndexEntry = match serde_json::from_str(&line) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable archive index line");
                continue;
            }
        };
        if entry.content_id == content_id && entry.format == format {
            found = Some(entry);
        }
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(content_id: &str, format: Format, reference: &str) -> IndexEntry {
        IndexEntry {
            timestamp: Utc::now(),
            content_id: content_id.to_string(),
            format,
            reference: reference.to_string(),
            title: "T".to_string(),
            duration_seconds: 180,
            size_bytes: Some(1024),
            message_id: Some(7),
        }
    }

    #[tokio::test]
    async fn test_missing_index_is_empty() {
        let temp = TempDir::new().unwrap();
        let index = ArchiveIndex::new(temp.path().join("index.jsonl"));
        assert!(index.find("K1", Format::Audio).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_entry_wins() {
        let temp = TempDir::new().unwrap();
        let index = ArchiveIndex::new(temp.path().join("nested").join("index.jsonl"));

        index.append(entry("K1", Format::Audio, "file-old")).await.unwrap();
        index.append(entry("K1", Format::Video, "file-video")).await.unwrap();
        index.append(entry("K1", Format::Audio, "file-new")).await.unwrap();

        let found = index.find("K1", Format::Audio).await.unwrap().unwrap();
        assert_eq!(found.reference, "file-new");

        let video = index.find("K1", Format::Video).await.unwrap().unwrap();
        assert_eq!(video.reference, "file-video");

        assert!(index.find("K2", Format::Audio).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreadable_lines_are_skipped() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("index.jsonl");
        let index = ArchiveIndex::new(path.clone());

        index.append(entry("K1", Format::Audio, "file-1")).await.unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"{not json\n")
            .unwrap();

        let found = index.find("K1", Format::Audio).await.unwrap().unwrap();
        assert_eq!(found.reference, "file-1");
    }
}
