//! Retry policy for message handlers.
//!
//! Exponential backoff with symmetric jitter, bounded by a total number of
//! handler invocations. Plugs into `backon` as a `BackoffBuilder`.

use std::time::Duration;

use backon::BackoffBuilder;
use rand::Rng;

/// Bounded retry with exponential backoff.
///
/// `max_attempts` counts handler invocations, so a policy of 3 yields at
/// most two delays. Values below 1 are treated as 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction in `[0, 1]`; each delay is scaled by a factor in `1 ± jitter`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Total handler invocations allowed.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before the retry following failed invocation `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = 2u32.saturating_pow(attempt);
        let raw = self.base_delay.saturating_mul(exp).min(self.max_delay);

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || raw.is_zero() {
            return raw;
        }
        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        raw.mul_f64(factor)
    }

    /// Upper bound of the time one message can spend in backoff.
    pub fn max_total_delay(&self) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        self.max_delay
            .mul_f64(1.0 + jitter)
            .saturating_mul(self.attempts() - 1)
    }
}

/// Delays between successive attempts of one message.
#[derive(Debug, Clone)]
pub struct PolicyBackoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Iterator for PolicyBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt + 1 >= self.policy.attempts() {
            return None;
        }
        self.attempt += 1;
        Some(self.policy.delay_for(self.attempt))
    }
}

impl BackoffBuilder for RetryPolicy {
    type Backoff = PolicyBackoff;

    fn build(self) -> Self::Backoff {
        PolicyBackoff {
            policy: self,
            attempt: 0,
        }
    }
}
