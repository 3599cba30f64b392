//! Core resolution logic.
//!
//! This module contains:
//! - MemoryCache: bounded FIFO + TTL cache
//! - InFlightRegistry: per-key single-flight tickets
//! - PendingPoll: bounded wait on another process's pending record
//! - RetryPolicy: origin retry/back-off
//! - BackgroundPromoter: archive promotion worker
//! - EventLog: append-only resolution event log
//! - ResolutionService: the tiered coordinator

pub mod cache;
pub mod event_log;
pub mod inflight;
pub mod poll;
pub mod promoter;
pub mod retry;
pub mod service;

// Re-export commonly used types
pub use cache::{CacheConfig, CacheEntry, CacheStats, MemoryCache};
pub use event_log::EventLog;
pub use inflight::{Acquired, FollowerOutcome, InFlightConfig, InFlightRegistry, LeaderGuard};
pub use poll::{PendingPoll, PollConfig, PollStep};
pub use promoter::{BackgroundPromoter, PromotionConfig, PromotionJob, PromotionOutcome, PromotionStats};
pub use retry::RetryPolicy;
pub use service::{ResolutionService, ServiceConfig};
