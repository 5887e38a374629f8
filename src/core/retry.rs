use std::time::Duration;

/// Delay between a failed attempt and the next eligible dequeue.
///
/// Exponential: `min(2^attempts * base_delay, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Requeued jobs are claimable right away.
    pub fn immediate() -> Self {
        Self::exponential(Duration::ZERO, Duration::ZERO)
    }

    pub fn delay_for(&self, attempts: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(2), Duration::from_secs(300))
    }
}
