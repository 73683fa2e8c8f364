//! Declarative resilience policy definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How a timeout policy gives up on an in-flight call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutStrategy {
    /// Signal cancellation to the unit of work and let it return
    #[default]
    Optimistic,
    /// Abandon the in-flight call immediately
    Pessimistic,
}

/// Position of a policy inside a composed chain, outermost first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PolicyStage {
    Fallback,
    Timeout,
    Retry,
    CircuitBreaker,
}

/// One resilience behaviour and its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyDefinition {
    /// Re-invoke up to `count` times without waiting
    Retry { count: u32 },

    /// Re-invoke up to `count` times, waiting a fixed interval
    RetryWithWait {
        count: u32,
        #[serde(with = "humantime_serde")]
        wait: Duration,
    },

    /// Re-invoke up to `count` times, waiting `0.1ms * factor^attempt`
    RetryExponentialBackoff { count: u32, factor: u32 },

    /// Bound everything nested inside this policy
    Timeout {
        #[serde(with = "humantime_serde")]
        timeout: Duration,
        #[serde(default)]
        strategy: TimeoutStrategy,
    },

    /// Break after more than `failures_allowed` consecutive failures
    CircuitBreaker {
        failures_allowed: u32,
        #[serde(with = "humantime_serde")]
        break_duration: Duration,
    },

    /// Break when the failure ratio inside a sampling window crosses a threshold
    AdvancedCircuitBreaker {
        failure_threshold: f64,
        #[serde(with = "humantime_serde")]
        sampling: Duration,
        min_throughput: u32,
        #[serde(with = "humantime_serde")]
        break_duration: Duration,
    },

    /// Last chance: run the caller's compensating action
    Fallback,
}

impl PolicyDefinition {
    /// Stage used to order the policy within a chain
    pub fn stage(&self) -> PolicyStage {
        match self {
            PolicyDefinition::Fallback => PolicyStage::Fallback,
            PolicyDefinition::Timeout { .. } => PolicyStage::Timeout,
            PolicyDefinition::Retry { .. }
            | PolicyDefinition::RetryWithWait { .. }
            | PolicyDefinition::RetryExponentialBackoff { .. } => PolicyStage::Retry,
            PolicyDefinition::CircuitBreaker { .. }
            | PolicyDefinition::AdvancedCircuitBreaker { .. } => PolicyStage::CircuitBreaker,
        }
    }

    /// Name a policy gets when none is declared explicitly
    pub fn default_name(&self) -> &'static str {
        match self {
            PolicyDefinition::Retry { .. } => "Retry",
            PolicyDefinition::RetryWithWait { .. } => "RetryWithWait",
            PolicyDefinition::RetryExponentialBackoff { .. } => "RetryExponentialBackoff",
            PolicyDefinition::Timeout { .. } => "Timeout",
            PolicyDefinition::CircuitBreaker { .. } => "CircuitBreaker",
            PolicyDefinition::AdvancedCircuitBreaker { .. } => "AdvancedCircuitBreaker",
            PolicyDefinition::Fallback => "Fallback",
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, PolicyDefinition::Fallback)
    }
}

/// A policy definition registered under a name
///
/// Transient-failure tables refer to policies by this name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedPolicy {
    pub name: String,
    #[serde(flatten)]
    pub definition: PolicyDefinition,
}

impl NamedPolicy {
    pub fn new(name: impl Into<String>, definition: PolicyDefinition) -> Self {
        Self {
            name: name.into(),
            definition,
        }
    }

    /// Whether this policy answers to `name` (trimmed, case-insensitive)
    pub fn answers_to(&self, name: &str) -> bool {
        self.name.trim().eq_ignore_ascii_case(name.trim())
    }
}

impl From<PolicyDefinition> for NamedPolicy {
    fn from(definition: PolicyDefinition) -> Self {
        Self::new(definition.default_name(), definition)
    }
}

impl fmt::Display for NamedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.definition.default_name())
    }
}
