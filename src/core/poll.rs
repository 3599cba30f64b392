//! Bounded wait on a `pending` record owned by another process.
//!
//! The poll is a plain state machine: the caller feeds it each observed
//! record and sleeps for whatever [`PollStep::Wait`] says. Keeping the
//! sleeping outside makes attempt counting and give-up behavior testable
//! without a clock.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::domain::ResolutionRecord;

/// Poll settings for cross-process coalescing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Delay between store reads
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Store reads before giving up and fetching ourselves
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// A pending record older than this is presumed orphaned and not waited on
    #[serde(default = "default_pending_stale_seconds")]
    pub pending_stale_seconds: u64,
}

fn default_interval_ms() -> u64 {
    3000
}
fn default_max_attempts() -> u32 {
    20
}
fn default_pending_stale_seconds() -> u64 {
    300
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_attempts: default_max_attempts(),
            pending_stale_seconds: default_pending_stale_seconds(),
        }
    }
}

/// What to do after an observation
#[derive(Debug, Clone, PartialEq)]
pub enum PollStep {
    /// Still pending; sleep this long and observe again
    Wait(Duration),

    /// The owning process finished (resolved or failed)
    Settled(ResolutionRecord),

    /// Attempts used up; fetch ourselves
    Exhausted,

    /// The pending record is too old to be anyone's live attempt
    Orphaned,

    /// The record disappeared (operator reset)
    Vanished,
}

/// Poll state: attempt count and fixed interval
#[derive(Debug, Clone)]
pub struct PendingPoll {
    attempt: u32,
    max_attempts: u32,
    interval: Duration,
    stale_after: chrono::Duration,
}

impl PendingPoll {
    pub fn new(config: &PollConfig) -> Self {
        Self {
            attempt: 0,
            max_attempts: config.max_attempts,
            interval: Duration::from_millis(config.interval_ms),
            stale_after: chrono::Duration::seconds(config.pending_stale_seconds as i64),
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Feed the latest store read and get the next step
    pub fn observe(&mut self, record: Option<&ResolutionRecord>) -> PollStep {
        let record = match record {
            Some(r) => r,
            None => return PollStep::Vanished,
        };

        if record.status.is_terminal() {
            return PollStep::Settled(record.clone());
        }

        if Utc::now() - record.created_at > self.stale_after {
            return PollStep::Orphaned;
        }

        if self.attempt >= self.max_attempts {
            return PollStep::Exhausted;
        }

        self.attempt += 1;
        PollStep::Wait(self.interval)
    }
}
