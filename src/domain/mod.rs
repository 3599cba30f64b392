//! Domain types for the resolver.
//!
//! This module contains the core data structures:
//! - ContentKey: the `(content id, format)` lookup key
//! - ResolutionRecord: durable per-key status
//! - Resolution / ResolveResponse: results and their wire shape
//! - ResolutionEvent: observability log entries

pub mod events;
pub mod key;
pub mod record;
pub mod resolution;

// Re-export commonly used types
pub use events::{EventType, ResolutionEvent};
pub use key::{ContentKey, Format};
pub use record::{RecordUpdate, ResolutionRecord, ResolutionStatus};
pub use resolution::{Resolution, ResolutionSource, ResolveError, ResolveResponse};
