//! Retry and backoff policy for failed job attempts.
//!
//! The policy is a pure function of the attempt counters and the queue
//! configuration: it decides between scheduling another attempt (with a
//! computed delay) and dead-lettering the job. Error contents never
//! influence the decision.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::TaskmillError;

/// Hard ceiling applied to every computed retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(10 * 60);

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Constant delay between all retries.
    #[default]
    Fixed,
    /// Delay doubles with each failed attempt: `base * 2^(attempt - 1)`.
    Exponential,
}

impl std::str::FromStr for Backoff {
    type Err = TaskmillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(Backoff::Fixed),
            "exponential" => Ok(Backoff::Exponential),
            other => Err(TaskmillError::validation(format!(
                "unknown backoff strategy: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backoff::Fixed => f.write_str("fixed"),
            Backoff::Exponential => f.write_str("exponential"),
        }
    }
}

/// Outcome of consulting the policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after `delay`.
    Retry { delay: Duration },
    /// The retry budget is exhausted; dead-letter the job.
    Dead,
}

/// Per-queue retry configuration.
///
/// # Examples
///
/// ```rust
/// use taskmill::retry::{Backoff, RetryDecision, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(3, Duration::from_secs(1), Backoff::Exponential);
///
/// // Delays after attempts 1..=3: 1s, 2s, 4s.
/// assert_eq!(
///     policy.decide(1),
///     RetryDecision::Retry { delay: Duration::from_secs(1) }
/// );
/// assert_eq!(
///     policy.decide(3),
///     RetryDecision::Retry { delay: Duration::from_secs(4) }
/// );
/// // Attempt 4 was the last allowed execution.
/// assert_eq!(policy.decide(4), RetryDecision::Dead);
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    retry_delay: Duration,
    backoff: Backoff,
    /// Multiplicative jitter factor in `[0, 0.2]`; `None` disables jitter.
    jitter: Option<f64>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration, backoff: Backoff) -> Self {
        Self {
            max_retries,
            retry_delay,
            backoff,
            jitter: None,
        }
    }

    /// Enables multiplicative jitter, clamped to at most ±20%.
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter = Some(factor.clamp(0.0, 0.2));
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decides retry vs dead-letter given the number of attempts executed so
    /// far (the failed one included).
    pub fn decide(&self, attempts_so_far: u32) -> RetryDecision {
        if attempts_so_far >= self.max_retries + 1 {
            return RetryDecision::Dead;
        }

        let base = match self.backoff {
            Backoff::Fixed => self.retry_delay,
            Backoff::Exponential => {
                // Cap the exponent; 2^30 seconds is already far past the ceiling.
                let exp = attempts_so_far.saturating_sub(1).min(30);
                self.retry_delay.saturating_mul(1u32 << exp)
            }
        };

        let mut delay = base.min(MAX_RETRY_DELAY);

        if let Some(factor) = self.jitter {
            if factor > 0.0 {
                let spread = rand::thread_rng().gen_range((1.0 - factor)..=(1.0 + factor));
                delay = Duration::from_millis((delay.as_millis() as f64 * spread) as u64)
                    .min(MAX_RETRY_DELAY);
            }
        }

        RetryDecision::Retry { delay }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay_is_constant() {
        let policy = RetryPolicy::new(5, Duration::from_secs(30), Backoff::Fixed);

        for attempt in 1..=5 {
            assert_eq!(
                policy.decide(attempt),
                RetryDecision::Retry {
                    delay: Duration::from_secs(30)
                }
            );
        }
        assert_eq!(policy.decide(6), RetryDecision::Dead);
    }

    #[test]
    fn test_exponential_doubles() {
        let policy = RetryPolicy::new(4, Duration::from_secs(1), Backoff::Exponential);

        let expected = [1u64, 2, 4, 8];
        for (attempt, secs) in expected.iter().enumerate() {
            assert_eq!(
                policy.decide(attempt as u32 + 1),
                RetryDecision::Retry {
                    delay: Duration::from_secs(*secs)
                }
            );
        }
    }

    #[test]
    fn test_delay_clamped_to_ceiling() {
        let policy = RetryPolicy::new(40, Duration::from_secs(60), Backoff::Exponential);

        // 60s * 2^9 is far past ten minutes.
        assert_eq!(
            policy.decide(10),
            RetryDecision::Retry {
                delay: MAX_RETRY_DELAY
            }
        );
        // Huge attempt counts must not overflow.
        assert_eq!(
            policy.decide(35),
            RetryDecision::Retry {
                delay: MAX_RETRY_DELAY
            }
        );
    }

    #[test]
    fn test_zero_max_retries_goes_straight_to_dead() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1), Backoff::Fixed);
        assert_eq!(policy.decide(1), RetryDecision::Dead);
    }

    #[test]
    fn test_jitter_stays_within_spread_and_ceiling() {
        let policy =
            RetryPolicy::new(3, Duration::from_secs(100), Backoff::Fixed).with_jitter(0.2);

        for _ in 0..100 {
            match policy.decide(1) {
                RetryDecision::Retry { delay } => {
                    assert!(delay >= Duration::from_secs(80));
                    assert!(delay <= Duration::from_secs(120));
                }
                RetryDecision::Dead => panic!("expected retry"),
            }
        }
    }

    #[test]
    fn test_jitter_factor_is_clamped() {
        let policy =
            RetryPolicy::new(3, Duration::from_secs(100), Backoff::Fixed).with_jitter(5.0);

        for _ in 0..100 {
            match policy.decide(1) {
                RetryDecision::Retry { delay } => {
                    assert!(delay >= Duration::from_secs(80));
                    assert!(delay <= Duration::from_secs(120));
                }
                RetryDecision::Dead => panic!("expected retry"),
            }
        }
    }

    #[test]
    fn test_backoff_parsing() {
        assert_eq!("fixed".parse::<Backoff>().unwrap(), Backoff::Fixed);
        assert_eq!(
            "Exponential".parse::<Backoff>().unwrap(),
            Backoff::Exponential
        );
        assert!("linear".parse::<Backoff>().is_err());
    }
}
