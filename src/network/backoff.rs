//! Reconnect delay policy.
//!
//! The session only ever asks "how long before attempt N"; the answer is a
//! pluggable [`RetryDelay`]. There is no attempt ceiling: while a session is
//! open it keeps reconnecting.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Attempt count to delay
#[derive(Clone)]
pub struct RetryDelay(Arc<dyn Fn(u32) -> Duration + Send + Sync>);

impl RetryDelay {
    pub fn new(delay: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Self(Arc::new(delay))
    }

    /// First attempt is immediate, then `base * 2^attempt` capped at `max`
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self::new(move |attempt| exponential_delay(attempt, base, max))
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(move |_| delay)
    }

    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        (self.0)(attempt)
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::exponential(DEFAULT_RETRY_BASE_DELAY, DEFAULT_RETRY_MAX_DELAY)
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RetryDelay").finish()
    }
}

pub fn exponential_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(multiplier).min(max)
}

/// Serializable retry settings, as found in the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Spread each delay by up to 20% in either direction
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY.as_millis() as u64,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY.as_millis() as u64,
            jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn to_retry_delay(&self) -> RetryDelay {
        let base = Duration::from_millis(self.base_delay_ms);
        let max = Duration::from_millis(self.max_delay_ms);
        if !self.jitter {
            return RetryDelay::exponential(base, max);
        }
        RetryDelay::new(move |attempt| {
            let delay = exponential_delay(attempt, base, max);
            if delay.is_zero() {
                return delay;
            }
            let factor = rand::thread_rng().gen_range(0.8..=1.2);
            delay.mul_f64(factor)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let delay = RetryDelay::default();
        assert_eq!(delay.delay_for(0), Duration::ZERO);
        assert_eq!(delay.delay_for(1), Duration::from_millis(2000));
        assert_eq!(delay.delay_for(2), Duration::from_millis(4000));
        assert_eq!(delay.delay_for(4), Duration::from_millis(16000));
        assert_eq!(delay.delay_for(5), DEFAULT_RETRY_MAX_DELAY);
        assert_eq!(delay.delay_for(200), DEFAULT_RETRY_MAX_DELAY);
    }

    #[test]
    fn test_custom_policies() {
        assert_eq!(RetryDelay::immediate().delay_for(17), Duration::ZERO);
        assert_eq!(
            RetryDelay::fixed(Duration::from_millis(5)).delay_for(3),
            Duration::from_millis(5)
        );
        let linear = RetryDelay::new(|attempt| Duration::from_millis(10 * attempt as u64));
        assert_eq!(linear.delay_for(3), Duration::from_millis(30));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RetryConfig {
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            jitter: true,
        };
        let delay = config.to_retry_delay();

        assert_eq!(delay.delay_for(0), Duration::ZERO);
        for _ in 0..50 {
            let d = delay.delay_for(2);
            assert!(d >= Duration::from_millis(320) && d <= Duration::from_millis(480));
        }
    }

    #[test]
    fn test_config_defaults_match_constants() {
        let config = RetryConfig::default();
        let delay = config.to_retry_delay();
        assert_eq!(delay.delay_for(3), Duration::from_millis(8000));
    }
}
