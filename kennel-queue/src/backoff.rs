//! Retry delay policies.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Upper bound on any retry delay: one year
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// How long a failed job waits before it becomes visible again.
///
/// `Linear` grows the delay with the attempt count: `base * max(1, attempts)`.
/// `Exponential` doubles it per attempt up to a cap, with optional jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum BackoffPolicy {
    #[default]
    Linear,
    Exponential {
        max_delay_seconds: u64,
        /// Fraction of the delay to randomize, clamped to `0.0..=1.0`
        jitter: f64,
    },
}

impl BackoffPolicy {
    /// Capped exponential backoff without jitter
    pub fn exponential(max_delay_seconds: u64) -> Self {
        Self::Exponential {
            max_delay_seconds,
            jitter: 0.0,
        }
    }

    /// Delay before the next attempt of a job that has been leased `attempts` times.
    ///
    /// Never exceeds [`MAX_RETRY_DELAY`].
    pub fn delay_for(&self, base_seconds: u64, attempts: u32) -> Duration {
        let attempts = attempts.max(1);
        let delay = match self {
            Self::Linear => Duration::from_secs(base_seconds.saturating_mul(u64::from(attempts))),
            Self::Exponential {
                max_delay_seconds,
                jitter,
            } => {
                let factor = 1u64.checked_shl(attempts - 1).unwrap_or(u64::MAX);
                let seconds = base_seconds.saturating_mul(factor).min(*max_delay_seconds);
                let delay = Duration::from_secs(seconds);
                apply_jitter(delay, *jitter)
            }
        };
        delay.min(MAX_RETRY_DELAY)
    }
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    let jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
    if jitter == 0.0 || delay.is_zero() {
        return delay;
    }
    let spread = rand::thread_rng().gen_range(-jitter..=jitter);
    delay.mul_f64((1.0 + spread).max(0.0))
}
