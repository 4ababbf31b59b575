use rand::Rng;
use std::time::Duration;

use crate::config::RetrySettings;

/// Timeout and backoff parameters for one class of remote calls.
///
/// A plain value: every component holds its own copy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            timeout: Duration::from_millis(settings.timeout_ms.max(1)),
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            backoff_multiplier: settings.backoff_multiplier.max(1.0),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter: Duration::from_millis(settings.jitter_ms),
        }
    }
}

impl RetryPolicy {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = Duration::ZERO;
        self
    }

    /// Deterministic part of the delay before retry number `attempt` (0-based):
    /// `min(base_delay * multiplier^attempt, max_delay)`
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Backoff for retry `attempt` (0-based) plus a fresh jitter sample
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_for(attempt) + self.sample_jitter()
    }

    /// Delays between attempts, one per allowed retry, jitter included
    pub fn delays(&self) -> impl Iterator<Item = Duration> + Send + 'static {
        let policy = self.clone();
        (0..self.max_retries).map(move |attempt| policy.delay_for(attempt))
    }

    fn sample_jitter(&self) -> Duration {
        let bound = self.jitter.as_millis() as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=bound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(1),
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(500),
            jitter: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_backoff_grows_then_caps() {
        let policy = policy();
        assert_eq!(policy.backoff_for(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(10), Duration::from_millis(500));
    }

    #[test]
    fn test_delays_stay_within_jitter_bound() {
        let policy = policy();
        let delays: Vec<Duration> = policy.delays().collect();
        assert_eq!(delays.len(), 5);
        for (attempt, delay) in delays.iter().enumerate() {
            let floor = policy.backoff_for(attempt as u32);
            assert!(*delay >= floor);
            assert!(*delay <= floor + Duration::from_millis(50));
        }
    }

    #[test]
    fn test_settings_are_clamped() {
        let settings = RetrySettings {
            timeout_ms: 0,
            backoff_multiplier: 0.5,
            ..RetrySettings::default()
        };
        let policy = RetryPolicy::from(&settings);
        assert_eq!(policy.timeout, Duration::from_millis(1));
        assert_eq!(policy.backoff_multiplier, 1.0);
    }
}
