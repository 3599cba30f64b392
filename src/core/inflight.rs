//! In-process single-flight coordination.
//!
//! The first caller for a key becomes the leader and does the work; every
//! other caller for that key becomes a follower and waits for the leader's
//! outcome on a `watch` channel. A ticket older than the timeout is treated
//! as abandoned and handed to the next caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::{ContentKey, Resolution, ResolveError};

/// Outcome a leader publishes to its followers
pub type TicketOutcome = Result<Resolution, ResolveError>;

/// In-flight coordination settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InFlightConfig {
    /// Slack a ticket gets for store, archive and publish work, on top of
    /// the leader's pending-wait and origin retry budget
    #[serde(default = "default_ticket_timeout")]
    pub ticket_timeout_seconds: u64,

    /// How many times a follower may fall back to re-acquiring
    #[serde(default = "default_max_follower_retries")]
    pub max_follower_retries: u32,
}

fn default_ticket_timeout() -> u64 {
    60
}
fn default_max_follower_retries() -> u32 {
    3
}

impl Default for InFlightConfig {
    fn default() -> Self {
        Self {
            ticket_timeout_seconds: default_ticket_timeout(),
            max_follower_retries: default_max_follower_retries(),
        }
    }
}

impl InFlightConfig {
    pub fn ticket_timeout(&self) -> Duration {
        Duration::from_secs(self.ticket_timeout_seconds)
    }
}

#[derive(Debug, Clone)]
enum Signal {
    Waiting,
    Done(TicketOutcome),
    Abandoned,
}

struct Ticket {
    generation: u64,
    created_at: Instant,
    tx: watch::Sender<Signal>,
}

type TicketMap = Arc<Mutex<HashMap<ContentKey, Arc<Ticket>>>>;

/// Role handed out by [`InFlightRegistry::acquire`]
pub enum Acquired {
    Leader(LeaderGuard),
    Follower(Follower),
}

/// What a follower observed while waiting
#[derive(Debug, Clone)]
pub enum FollowerOutcome {
    /// The leader finished with this outcome
    Completed(TicketOutcome),

    /// The ticket outlived its timeout
    Expired,

    /// The leader went away without releasing
    Abandoned,
}

/// Registry of open tickets, one per key
pub struct InFlightRegistry {
    tickets: TicketMap,
    timeout: Duration,
    next_generation: AtomicU64,
}

impl InFlightRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tickets: Arc::new(Mutex::new(HashMap::new())),
            timeout,
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Become leader for `key`, or follow the current leader
    pub fn acquire(&self, key: &ContentKey) -> Acquired {
        let mut tickets = self.tickets.lock();

        if let Some(ticket) = tickets.get(key) {
            if ticket.created_at.elapsed() < self.timeout {
                debug!(key = %key, generation = ticket.generation, "Joining in-flight resolution");
                return Acquired::Follower(Follower {
                    rx: ticket.tx.subscribe(),
                    deadline: ticket.created_at + self.timeout,
                });
            }
            warn!(
                key = %key,
                generation = ticket.generation,
                age_ms = ticket.created_at.elapsed().as_millis() as u64,
                "In-flight ticket expired, taking over"
            );
        }

        let (tx, _rx) = watch::channel(Signal::Waiting);
        let ticket = Arc::new(Ticket {
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            created_at: Instant::now(),
            tx,
        });
        tickets.insert(key.clone(), Arc::clone(&ticket));

        Acquired::Leader(LeaderGuard {
            key: key.clone(),
            ticket,
            tickets: Arc::clone(&self.tickets),
            released: false,
        })
    }

    /// Number of keys with an open ticket
    pub fn in_flight(&self) -> usize {
        self.tickets.lock().len()
    }

    /// Number of followers currently waiting on `key`
    pub fn waiters(&self, key: &ContentKey) -> usize {
        self.tickets
            .lock()
            .get(key)
            .map(|t| t.tx.receiver_count())
            .unwrap_or(0)
    }
}

/// Held by the leader; must be released with the outcome.
///
/// Dropping it unreleased publishes `Abandoned` so followers re-acquire
/// right away instead of waiting out the timeout.
pub struct LeaderGuard {
    key: ContentKey,
    ticket: Arc<Ticket>,
    tickets: TicketMap,
    released: bool,
}

impl LeaderGuard {
    pub fn key(&self) -> &ContentKey {
        &self.key
    }

    /// Publish the outcome to every follower and close the ticket
    pub fn release(mut self, outcome: TicketOutcome) {
        self.finish(Signal::Done(outcome));
    }

    fn finish(&mut self, signal: Signal) {
        self.released = true;
        {
            let mut tickets = self.tickets.lock();
            // An expired ticket may already have been replaced; leave the successor alone
            let current = tickets
                .get(&self.key)
                .map(|t| t.generation == self.ticket.generation)
                .unwrap_or(false);
            if current {
                tickets.remove(&self.key);
            }
        }
        self.ticket.tx.send_replace(signal);
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if !self.released {
            debug!(key = %self.key, "Leader dropped without releasing");
            self.finish(Signal::Abandoned);
        }
    }
}

/// Held by a follower until the leader publishes
pub struct Follower {
    rx: watch::Receiver<Signal>,
    deadline: Instant,
}

impl Follower {
    /// Wait for the leader, at most until the ticket's deadline
    pub async fn wait(mut self) -> FollowerOutcome {
        let waited = tokio::time::timeout_at(
            self.deadline,
            self.rx.wait_for(|s| !matches!(s, Signal::Waiting)),
        )
        .await;

        match waited {
            Ok(Ok(signal)) => match &*signal {
                Signal::Done(outcome) => FollowerOutcome::Completed(outcome.clone()),
                _ => FollowerOutcome::Abandoned,
            },
            // Sender gone without a value
            Ok(Err(_)) => FollowerOutcome::Abandoned,
            Err(_) => FollowerOutcome::Expired,
        }
    }
}
