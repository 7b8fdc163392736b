use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Attempt limit and exponential backoff for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(5),
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Retries forever with the default backoff.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            ..Self::default()
        }
    }

    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: Some(1),
            ..Self::default()
        }
    }

    /// Returns `true` if another attempt may follow `attempts_made` failures.
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts_made < max)
    }

    /// Backoff after failed attempt number `attempt` (1-based), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        Duration::try_from_secs_f64(scaled.min(self.max_delay.as_secs_f64()).max(0.0))
            .unwrap_or(self.max_delay)
    }

    /// [`base_delay`](Self::base_delay) scaled by a factor in `[0.75, 1.25)` so
    /// workers failing together do not retry in lockstep.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay(attempt).mul_f64(jitter_factor())
    }
}

fn jitter_factor() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    0.75 + 0.5 * (f64::from(nanos) / 1_000_000_000.0)
}
