//! Shared reconnect-backoff policy for both WebSocket channels (spec.md
//! §4.3, §4.4: exponential `2s × 2^n` capped at 30s; after 50 failed
//! attempts enter a fixed-interval infinite retry tier).

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_exponential_delay: Duration,
    pub attempts_before_infinite_tier: u32,
    pub infinite_tier_interval: Duration,
}

impl ReconnectPolicy {
    #[must_use]
    pub const fn market_data() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_exponential_delay: Duration::from_secs(30),
            attempts_before_infinite_tier: 50,
            infinite_tier_interval: Duration::from_secs(60),
        }
    }

    #[must_use]
    pub const fn user_channel() -> Self {
        // spec.md §4.4: "identical to §4.3 but with 60s base cap on the
        // infinite-retry tier" — both channels converge on 60s here.
        Self::market_data()
    }

    /// Returns the delay to wait before reconnect attempt number `attempt`
    /// (1-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt > self.attempts_before_infinite_tier {
            return self.infinite_tier_interval;
        }
        let millis = self.initial_delay.as_millis() as u64 * 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(millis).min(self.max_exponential_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_caps_at_30s() {
        let policy = ReconnectPolicy::market_data();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn after_fifty_attempts_infinite_tier_kicks_in() {
        let policy = ReconnectPolicy::market_data();
        assert_eq!(policy.delay_for_attempt(51), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(1000), Duration::from_secs(60));
    }
}
