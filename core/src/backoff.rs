use std::time::Duration;

/// Capped exponential backoff: the delay after failed attempt `k` is
/// `min(unit * 2^k, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    unit: Duration,
    cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            unit: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    pub fn new(unit: Duration, cap: Duration) -> Self {
        Self { unit, cap }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.unit.saturating_mul(factor).min(self.cap)
    }
}
