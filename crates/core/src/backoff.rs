//! Bounded retry policy with exponential backoff and jitter.
//!
//! Used for provisioning calls and for saga state writes. The policy only
//! does arithmetic; callers own the sleeping so they can race it against a
//! cancellation token.

use std::time::Duration;

use rand::Rng;

/// Tunable parameters for a bounded retry loop.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Randomise each delay into `[d/2, d]`.
    pub jitter: bool,
    /// Give up early once this much time has been spent.
    pub max_elapsed: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
            max_elapsed: Some(Duration::from_secs(60)),
        }
    }
}

impl BackoffPolicy {
    /// `attempts` tries with no delay between them.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
            max_elapsed: None,
        }
    }

    /// `attempts` tries separated by a constant `delay`.
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: attempts.max(1),
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: false,
            max_elapsed: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Un-jittered delay after `failed` consecutive failures (1-based).
    ///
    /// The result is clamped to [`max_delay`](Self::max_delay).
    pub fn base_delay(&self, failed: u32) -> Duration {
        let exponent = failed.saturating_sub(1).min(32) as i32;
        let ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = ms.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Delay to wait after `failed` attempts, or `None` when the caller must
    /// stop retrying.
    ///
    /// `elapsed` is the time already spent across all attempts; the retry is
    /// refused if sleeping would cross [`max_elapsed`](Self::max_elapsed).
    pub fn next_delay(&self, failed: u32, elapsed: Duration) -> Option<Duration> {
        if failed >= self.max_attempts.max(1) {
            return None;
        }

        let delay = self.base_delay(failed);
        let delay = if self.jitter { jittered(delay) } else { delay };

        if let Some(budget) = self.max_elapsed {
            if elapsed + delay > budget {
                return None;
            }
        }

        Some(delay)
    }
}

/// "Equal jitter": half the delay is fixed, the other half random.
fn jittered(delay: Duration) -> Duration {
    let ms = delay.as_millis() as u64;
    if ms < 2 {
        return delay;
    }
    let half = ms / 2;
    let extra = rand::rng().random_range(0..=ms - half);
    Duration::from_millis(half + extra)
}
