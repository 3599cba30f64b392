//! Retry policy for origin calls.
//!
//! Every attempt runs under a hard timeout. `NotFound` ends the loop at
//! once; everything else is retried with exponential back-off, stretched
//! further when the provider reports rate limiting.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::adapters::OriginError;
use crate::domain::{ContentKey, ResolveError};

/// Retry policy for origin fetches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Extra factor applied to the delay after a rate-limit response
    #[serde(default = "default_rate_limit_multiplier")]
    pub rate_limit_multiplier: f64,

    /// Hard ceiling for a single attempt in seconds
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_seconds: u64,
}

fn default_max_attempts() -> u32 {
    10
}
fn default_initial_delay() -> u64 {
    2000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    1.5
}
fn default_rate_limit_multiplier() -> f64 {
    4.0
}
fn default_attempt_timeout() -> u64 {
    120
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            rate_limit_multiplier: default_rate_limit_multiplier(),
            attempt_timeout_seconds: default_attempt_timeout(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Delay after a failed attempt, taking the failure kind into account
    pub fn delay_after(&self, attempt: u32, error: &OriginError) -> Duration {
        let base = self.delay_for_attempt(attempt);
        match error {
            OriginError::RateLimited { retry_after } => {
                let stretched = Duration::from_millis(
                    (base.as_millis() as f64 * self.rate_limit_multiplier) as u64,
                );
                match retry_after {
                    Some(hint) => stretched.max((*hint).min(self.max_rate_limit_delay())),
                    None => stretched,
                }
            }
            _ => base,
        }
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_seconds)
    }

    /// Longest sleep a provider hint can impose
    fn max_rate_limit_delay(&self) -> Duration {
        Duration::from_millis((self.max_delay_ms as f64 * self.rate_limit_multiplier) as u64)
    }

    /// Upper bound on how long `run` can take: every attempt times out and
    /// every pause is the longest a rate-limit hint can ask for
    pub fn max_elapsed(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        self.attempt_timeout() * attempts + self.max_rate_limit_delay() * (attempts - 1)
    }

    /// Run an origin call until it succeeds, hits `NotFound`, or attempts run out
    pub async fn run<T, F, Fut>(
        &self,
        key: &ContentKey,
        operation: &str,
        mut call: F,
    ) -> Result<T, ResolveError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OriginError>>,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let error = match tokio::time::timeout(self.attempt_timeout(), call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if !e.is_retryable() => {
                    debug!(key = %key, operation, attempt, error = %e, "Origin reported a terminal error");
                    return Err(ResolveError::NotFound {
                        key: key.clone(),
                        reason: match e {
                            OriginError::NotFound(reason) => reason,
                            other => other.to_string(),
                        },
                    });
                }
                Ok(Err(e)) => e,
                Err(_) => OriginError::Transient(format!(
                    "{} timed out after {:?}",
                    operation,
                    self.attempt_timeout()
                )),
            };

            if !self.should_retry(attempt) {
                warn!(key = %key, operation, attempt, error = %error, "Origin retries exhausted");
                return Err(match error {
                    OriginError::RateLimited { .. } => ResolveError::OriginRateLimited {
                        key: key.clone(),
                        attempts: attempt,
                    },
                    other => ResolveError::OriginTransient {
                        key: key.clone(),
                        attempts: attempt,
                        reason: other.to_string(),
                    },
                });
            }

            let delay = self.delay_after(attempt, &error);
            match error {
                OriginError::Processing(_) => {
                    debug!(key = %key, operation, attempt, delay_ms = delay.as_millis() as u64, "Origin still processing");
                }
                _ => {
                    warn!(
                        key = %key,
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Origin call failed, retrying"
                    );
                }
            }
            tokio::time::sleep(delay).await;
        }
    }
}
