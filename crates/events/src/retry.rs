//! Producer-side publish retries.

use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::bus::StreamBus;

/// Retry policy for stream publishes.
///
/// Exponential backoff: `initial_delay * 2^(attempt-1)`, capped at
/// `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = try once).
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Backoff before retry `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let shift = (attempt - 1).min(31);
        let delay = self
            .initial_delay
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_delay);
        delay.min(self.max_delay)
    }
}

/// Publish exhausted its retry budget.
#[derive(Debug, Error)]
#[error("publish failed after {attempts} attempt(s): {last_error}")]
pub struct PublishError {
    pub attempts: u32,
    pub last_error: String,
}

/// Publish with inline retries per the policy.
///
/// On exhaustion the caller decides what happens to the source row; the
/// downstream sink must be idempotent because a retried publish may have
/// partially succeeded.
pub fn publish_with_retry<M, B>(bus: &B, message: M, policy: RetryPolicy) -> Result<(), PublishError>
where
    M: Clone,
    B: StreamBus<M>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match bus.publish(message.clone()) {
            Ok(()) => return Ok(()),
            Err(err) if attempt <= policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = ?err, "publish failed, retrying");
                thread::sleep(delay);
            }
            Err(err) => {
                return Err(PublishError {
                    attempts: attempt,
                    last_error: format!("{err:?}"),
                });
            }
        }
    }
}
