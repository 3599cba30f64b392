//! Canonical file names and paths for tubecache state.
//!
//! Single source of truth - import this instead of hardcoding paths.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tubecache::config::paths;
//!
//! let db = paths::records_db()?;
//! let index = paths::archive_index()?;
//! ```
//!
//! ## Path Ownership
//!
//! | File | Owner | Purpose |
//! |------|-------|---------|
//! | records.db | PersistentStore | Resolution records (shared by every process) |
//! | archive_index.jsonl | TelegramArchive | Published copies, by content key |
//! | events.jsonl | EventLog | Observability only, safe to delete |

use std::path::PathBuf;

use anyhow::Result;

/// SQLite record store file name
pub const DB_FILE: &str = "records.db";

/// Archive upload index file name
pub const ARCHIVE_INDEX_FILE: &str = "archive_index.jsonl";

/// Resolution event log file name
pub const EVENTS_FILE: &str = "events.jsonl";

/// Get the tubecache home directory (~/.tubecache)
pub fn home() -> Result<PathBuf> {
    crate::config::tubecache_home()
}

/// Get the record store path (~/.tubecache/records.db)
pub fn records_db() -> Result<PathBuf> {
    crate::config::db_path()
}

/// Get the archive index path (~/.tubecache/archive_index.jsonl)
pub fn archive_index() -> Result<PathBuf> {
    crate::config::archive_index_path()
}

/// Get the event log path (~/.tubecache/events.jsonl)
pub fn events() -> Result<PathBuf> {
    crate::config::events_path()
}
