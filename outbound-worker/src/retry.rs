use std::time;

use crate::config::RetryPolicyConfig;

#[derive(Copy, Clone, Debug)]
/// How long the worker waits before retrying a rejected batch.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: time::Duration,
    /// Number of retries after which the worker gives up, `None` to retry forever.
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: time::Duration,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            max_attempts,
        }
    }

    /// Calculate the time to wait after the given number of past attempts.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        self.backoff_coefficient
            .checked_pow(attempt)
            .and_then(|factor| self.initial_interval.checked_mul(factor))
            .map_or(self.maximum_interval, |candidate| {
                std::cmp::min(candidate, self.maximum_interval)
            })
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

impl From<&RetryPolicyConfig> for RetryPolicy {
    fn from(config: &RetryPolicyConfig) -> Self {
        RetryPolicy::new(
            config.backoff_coefficient,
            config.initial_interval.0,
            config.maximum_interval.0,
            (config.max_attempts > 0).then_some(config.max_attempts),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: time::Duration::from_secs(100),
            max_attempts: None,
        }
    }
}
