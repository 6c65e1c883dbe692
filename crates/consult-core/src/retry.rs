use std::time::Duration;

/// Backoff policy for push-channel reconnect attempts.
///
/// Exponential doubling from a base delay up to a cap. A server-supplied
/// retry-after hint wins when it is larger than the computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base: Duration,
    cap: Duration,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base: base.max(Duration::from_millis(1)),
            cap: cap.max(base),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// Delay before reconnect attempt number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32, retry_after_hint: Option<Duration>) -> Duration {
        let doubled = self
            .base
            .checked_mul(1u32.checked_shl(attempt.min(20)).unwrap_or(u32::MAX))
            .unwrap_or(self.cap);
        let hinted = retry_after_hint.unwrap_or(Duration::ZERO);
        doubled.max(hinted).min(self.cap)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_waits_the_base_delay() {
        let policy = ReconnectPolicy::new(Duration::from_millis(250), Duration::from_secs(8));
        assert_eq!(policy.delay_for(0, None), Duration::from_millis(250));
    }

    #[test]
    fn doubles_per_attempt_until_the_cap() {
        let policy = ReconnectPolicy::new(Duration::from_millis(100), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3, None), Duration::from_millis(800));
        assert_eq!(policy.delay_for(60, None), Duration::from_secs(10));
    }

    #[test]
    fn larger_server_hint_wins() {
        let policy = ReconnectPolicy::default();
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
    }

    #[test]
    fn hint_is_still_capped() {
        let policy = ReconnectPolicy::new(Duration::from_millis(500), Duration::from_secs(5));
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(60))),
            Duration::from_secs(5)
        );
    }
}
