//! Wait strategies between retry attempts

use keystone_core::PolicyDefinition;
use std::time::Duration;

/// Base unit of the exponential backoff policy: 0.1 ms
const EXPONENTIAL_UNIT: Duration = Duration::from_micros(100);

/// Upper bound for computed waits
const MAX_DELAY: Duration = Duration::from_secs(30);

/// How long a retry policy waits before the next attempt
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Retry straight away
    Immediate,

    /// Same wait before every attempt
    Fixed,

    /// Attempt n waits `initial_delay * base^(n-1)`
    Exponential {
        base: f64,
    },
}

#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    strategy: BackoffStrategy,
    initial_delay: Duration,
    max_delay: Duration,
}

impl BackoffCalculator {
    pub fn new(strategy: BackoffStrategy, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy,
            initial_delay,
            max_delay,
        }
    }

    pub fn immediate() -> Self {
        Self::new(BackoffStrategy::Immediate, Duration::ZERO, Duration::ZERO)
    }

    /// Retry budget and wait calculator of a retry policy, `None` for other policies
    pub fn for_policy(definition: &PolicyDefinition) -> Option<(u32, Self)> {
        match definition {
            PolicyDefinition::Retry { count } => Some((*count, Self::immediate())),
            PolicyDefinition::RetryWithWait { count, wait } => Some((
                *count,
                Self::new(BackoffStrategy::Fixed, *wait, (*wait).max(MAX_DELAY)),
            )),
            PolicyDefinition::RetryExponentialBackoff { count, factor } => {
                // attempt n waits 0.1ms * factor^n
                let factor = (*factor).max(1);
                Some((
                    *count,
                    Self::new(
                        BackoffStrategy::Exponential {
                            base: factor as f64,
                        },
                        EXPONENTIAL_UNIT * factor,
                        MAX_DELAY,
                    ),
                ))
            }
            _ => None,
        }
    }

    /// Wait before retry `attempt`, counting from 1
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay = match &self.strategy {
            BackoffStrategy::Immediate => return Duration::ZERO,

            BackoffStrategy::Fixed => self.initial_delay,

            BackoffStrategy::Exponential { base } => {
                if attempt == 0 {
                    return Duration::ZERO;
                }
                let multiplier = base.powi(attempt as i32 - 1);
                let nanos = self.initial_delay.as_nanos() as f64 * multiplier;
                if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
                    self.max_delay
                } else {
                    Duration::from_nanos(nanos as u64)
                }
            }
        };

        base_delay.min(self.max_delay)
    }
}
