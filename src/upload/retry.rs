use std::time::Duration;

/// Exponential backoff between failed upload attempts, capped at a maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    /// Policy with the given base and cap; the cap is raised to at least the base.
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
        }
    }

    /// Delay after the first failure.
    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    /// Upper bound on any delay.
    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    /// Delay after the `failures`-th consecutive failure (1-based).
    pub fn delay_for_failures(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(20);
        let calculated = self.base_delay_ms.saturating_mul(1_u64 << shift);
        Duration::from_millis(calculated.min(self.max_delay_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1_000, 300_000)
    }
}
