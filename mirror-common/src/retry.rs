use std::time;

/// Reconnect delays for a streaming source.
///
/// The first failure reconnects immediately, the k-th waits
/// `initial_interval * backoff_coefficient^(k-2)` capped at `maximum_interval`.
/// Reaching `max_attempts` consecutive failures gives up.
#[derive(Copy, Clone, Debug)]
pub struct ReconnectPolicy {
    backoff_coefficient: u32,
    initial_interval: time::Duration,
    maximum_interval: time::Duration,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: time::Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before reconnecting after `failures` consecutive failures, or
    /// `None` once the ceiling is reached.
    pub fn delay_for(&self, failures: u32) -> Option<time::Duration> {
        if failures >= self.max_attempts {
            return None;
        }
        if failures <= 1 {
            return Some(time::Duration::ZERO);
        }

        let factor = self.backoff_coefficient.saturating_pow(failures - 2);
        let candidate = self
            .initial_interval
            .checked_mul(factor)
            .unwrap_or(self.maximum_interval);
        Some(candidate.min(self.maximum_interval))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: time::Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

/// Consecutive failure count of one source.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    failures: u32,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Records a failure and returns how long to wait, `None` when the source
    /// must give up.
    pub fn on_failure(&mut self) -> Option<time::Duration> {
        self.failures += 1;
        self.policy.delay_for(self.failures)
    }

    /// A stream that delivered data starts the count over.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn first_reconnect_is_immediate_then_backs_off() {
        let mut state = ReconnectState::new(ReconnectPolicy::default());
        assert_eq!(state.on_failure(), Some(Duration::ZERO));
        assert_eq!(state.on_failure(), Some(Duration::from_millis(1000)));
        assert_eq!(state.on_failure(), Some(Duration::from_millis(2000)));
        assert_eq!(state.on_failure(), Some(Duration::from_millis(4000)));
        // Fifth consecutive failure hits the ceiling.
        assert_eq!(state.on_failure(), None);
    }

    #[test]
    fn delay_is_capped() {
        let policy = ReconnectPolicy::new(10, Duration::from_secs(1), Duration::from_secs(30), 100);
        assert_eq!(policy.delay_for(3), Some(Duration::from_secs(10)));
        assert_eq!(policy.delay_for(4), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay_for(50), Some(Duration::from_secs(30)));
    }

    #[test]
    fn reset_starts_over() {
        let mut state = ReconnectState::new(ReconnectPolicy::default());
        state.on_failure();
        state.on_failure();
        state.reset();
        assert_eq!(state.failures(), 0);
        assert_eq!(state.on_failure(), Some(Duration::ZERO));
    }
}
