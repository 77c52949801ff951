use std::time::Duration;

/// Bounded exponential backoff applied to every network call.
///
/// A call is attempted once plus up to `max_retries` more times; before retry
/// `n` (0-based) the caller sleeps `base_delay * 2^n`, capped at `max_delay`.
/// Each attempt is bounded by `timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Default policy with a custom per-call timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    /// Delay before the given (0-based) retry.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(16)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// True while another attempt is allowed after `retries_done` retries.
    pub fn can_retry(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }
}
