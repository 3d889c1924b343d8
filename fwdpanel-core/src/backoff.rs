use std::time::Duration;

use rand::Rng;

use crate::CoreError;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Capped exponential retry schedule.
///
/// Attempt `n` (1-indexed) waits `min(base_delay * 2^(n-1), max_delay)`. Both
/// the channel client's reconnect loop and the backend supervisor's restart
/// loop count attempts against the same policy.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Fraction of each delay that may be shaved off at random, in `[0, 1]`.
    /// Zero keeps the schedule exact.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            jitter: 0.0,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.base_delay.is_zero() {
            return Err(CoreError::InvalidPolicy("base delay must be non-zero"));
        }
        if self.max_delay < self.base_delay {
            return Err(CoreError::InvalidPolicy(
                "max delay must not be below base delay",
            ));
        }
        if self.max_attempts == 0 {
            return Err(CoreError::InvalidPolicy("max attempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(CoreError::InvalidPolicy("jitter must be within [0, 1]"));
        }
        Ok(())
    }

    /// Whether a 1-indexed attempt number is still within the cap.
    #[must_use]
    pub const fn allows(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_attempts
    }

    /// Exact delay before attempt `attempt` (1-indexed). Attempt 0 is treated as 1.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1_u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// `delay_for` with the configured jitter applied.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let shave = rand::rng().random_range(0.0..=self.jitter.min(1.0));
        delay.mul_f64(1.0 - shave)
    }

    /// Sum of every delay the policy will ever wait before giving up.
    #[must_use]
    pub fn total_budget(&self) -> Duration {
        (1..=self.max_attempts)
            .map(|attempt| self.delay_for(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}
