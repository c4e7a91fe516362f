use rand::{thread_rng, Rng};
use std::time::Duration;

/// Maximum write attempts for a transient store failure (initial try included).
pub const MAX_ATTEMPTS: u32 = 5;

/// Delay before retry number `attempt` (1-based): exponential growth from
/// `base` with capped shift and additive jitter.
pub fn delay(base: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let exp = base_ms.saturating_mul(1u64 << attempt.min(6));
    let jitter = thread_rng().gen_range(0..(exp / 4 + 1));
    Duration::from_millis(exp + jitter)
}

/// Retry policy for transient store errors.
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    pub max_attempts: u32,
    pub base: Duration,
}

impl Retry {
    pub fn transient() -> Self {
        Retry { max_attempts: MAX_ATTEMPTS, base: Duration::from_millis(50) }
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub async fn sleep(&self, attempt: u32) {
        tokio::time::sleep(delay(self.base, attempt)).await;
    }
}
