use std::time::Duration;

/// Linear wait between retries: `base` per consecutive failure, never more
/// than `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub const fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn wait(&self, consecutive_failures: u32) -> Duration {
        self.base.saturating_mul(consecutive_failures).min(self.cap)
    }
}
