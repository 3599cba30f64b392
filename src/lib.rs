//! tubecache - Tiered content resolution
//!
//! Turns a `(content id, format)` request into a playable URL as fast as
//! possible, fetching from the slow origin at most once per key and
//! warming faster tiers for the next caller.
//!
//! # Architecture
//!
//! Requests walk the tiers from fastest to slowest:
//! - In-process memory cache (FIFO + TTL)
//! - In-flight registry, so concurrent callers share one fetch
//! - Persistent record store, shared by every process
//! - Archive of previously published copies
//! - Origin fetch, followed by background promotion into the archive
//!
//! # Modules
//!
//! - `adapters`: Archive and origin integrations (Telegram, yt-dlp)
//! - `core`: Tiers and coordination (cache, in-flight, promoter, service)
//! - `domain`: Data structures (ContentKey, ResolutionRecord, ResolveResponse)
//! - `store`: Durable records (SQLite, in-memory)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Resolve a key
//! tubecache resolve dQw4w9WgXcQ --format audio
//!
//! # Inspect the stored record
//! tubecache status dQw4w9WgXcQ
//!
//! # Clear a failed record
//! tubecache reset dQw4w9WgXcQ
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod store;

// Re-export main types at crate root for convenience
pub use core::{ResolutionService, ServiceConfig};
pub use domain::{ContentKey, Format, Resolution, ResolutionSource, ResolveError, ResolveResponse};
pub use store::{MemoryStore, PersistentStore, SqliteStore};

// Collaborator traits and concrete adapters
pub use adapters::{ArchiveSearch, OriginFetchService, TelegramArchive, TelegramConfig, YtDlpOrigin};
