//! Retry delay policies shared by the task queue and the element checker.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay strategy applied between retry attempts.
///
/// `attempt` is the 1-based retry number: the delay before the first retry is
/// `delay_for(1)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Retry immediately.
    None,
    /// Same delay before every retry.
    Fixed { delay_ms: u64 },
    /// `base_ms * attempt`, capped at `max_ms`.
    Linear { base_ms: u64, max_ms: u64 },
    /// `base_ms * 2^(attempt - 1)`, capped at `max_ms`, optionally jittered
    /// down to a random fraction of the computed delay.
    Exponential { base_ms: u64, max_ms: u64, jitter: bool },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Fixed { delay_ms: 2_000 }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match *self {
            BackoffPolicy::None => Duration::ZERO,
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            BackoffPolicy::Linear { base_ms, max_ms } => {
                Duration::from_millis(base_ms.saturating_mul(attempt as u64).min(max_ms))
            }
            BackoffPolicy::Exponential {
                base_ms,
                max_ms,
                jitter,
            } => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                let delay = Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms));
                if jitter {
                    tokio_retry::strategy::jitter(delay)
                } else {
                    delay
                }
            }
        }
    }

    /// Delays for `retries` consecutive retries, in the shape `tokio_retry` consumes.
    pub fn delays(self, retries: u32) -> impl Iterator<Item = Duration> {
        (1..=retries).map(move |attempt| self.delay_for(attempt))
    }
}
