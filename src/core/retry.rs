use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay
    Fixed,
    /// Linear increase
    Linear,
    /// Exponential backoff
    Exponential,
    /// Exponential with jitter
    ExponentialJitter,
}

/// Retry policy for a single request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Base delay between retries
    pub base_delay_ms: u64,
    /// Maximum delay between retries
    pub max_delay_ms: u64,
    /// Multiplier for exponential strategies
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    pub backoff: BackoffStrategy,
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: default_multiplier(),
            backoff: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Total number of attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let base = self.base_delay_ms as f64;
        let millis = match self.backoff {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * retry as f64,
            BackoffStrategy::Exponential => base * self.multiplier.powi(retry as i32 - 1),
            BackoffStrategy::ExponentialJitter => {
                let exp = base * self.multiplier.powi(retry as i32 - 1);
                // full jitter in [exp/2, exp]
                exp / 2.0 + fastrand::f64() * exp / 2.0
            }
        };
        let capped = millis.round().min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.max_delay_ms < self.base_delay_ms {
            return Err(crate::DagwireError::configuration_field(
                "max_delay_ms must be at least base_delay_ms",
                "retry.max_delay_ms",
            ));
        }
        if !(self.multiplier >= 1.0) {
            return Err(crate::DagwireError::configuration_field(
                "multiplier must be >= 1.0",
                "retry.multiplier",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay_ms: 10,
            max_delay_ms: 50,
            multiplier: 2.0,
            backoff: BackoffStrategy::Exponential,
        };
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
        // capped
        assert_eq!(policy.delay_for(4), Duration::from_millis(50));
        assert_eq!(policy.max_attempts(), 6);
    }

    #[test]
    fn test_linear_and_fixed() {
        let mut policy = RetryPolicy {
            backoff: BackoffStrategy::Linear,
            base_delay_ms: 5,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(3), Duration::from_millis(15));
        policy.backoff = BackoffStrategy::Fixed;
        assert_eq!(policy.delay_for(3), Duration::from_millis(5));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy {
            backoff: BackoffStrategy::ExponentialJitter,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let delay = policy.delay_for(2).as_millis();
            assert!((100..=200).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        let bad = RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 10,
            ..RetryPolicy::default()
        };
        assert!(bad.validate().is_err());
    }
}
