//! Transient-failure table document

use keystone_core::NamedPolicy;
use serde::{Deserialize, Serialize};

use crate::error::ConfigResult;
use crate::validation::{require_non_blank, require_positive, Validatable};

/// The whole policy table document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyTableConfig {
    /// Rules mapping failure patterns to policy names
    pub transient_failures: Vec<TransientFailureEntry>,

    /// Policy instances available for composition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<NamedPolicy>,
}

/// One transient-failure rule as written in the document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransientFailureEntry {
    /// Namespace qualifier the patterns are resolved in (`*` for any)
    pub source: String,

    /// Comma-separated failure-name patterns
    pub failures: String,

    /// Comma-separated, ordered policy names
    pub policies: String,
}

impl TransientFailureEntry {
    /// Distinct, lower-cased failure patterns
    pub fn failure_patterns(&self) -> Vec<String> {
        split_comma_separated(&self.failures)
            .into_iter()
            .map(|p| p.to_lowercase())
            .fold(Vec::new(), |mut acc, p| {
                if !acc.contains(&p) {
                    acc.push(p);
                }
                acc
            })
    }

    /// Distinct policy names, in declaration order
    pub fn policy_names(&self) -> Vec<String> {
        split_comma_separated(&self.policies)
    }
}

/// Split a comma-separated list, trimming entries, dropping empties and
/// keeping the first occurrence of duplicates
pub fn split_comma_separated(value: &str) -> Vec<String> {
    let mut items: Vec<String> = Vec::new();
    for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !items.iter().any(|existing| existing == item) {
            items.push(item.to_string());
        }
    }
    items
}

impl Validatable for TransientFailureEntry {
    fn validate(&self) -> ConfigResult<()> {
        require_non_blank(&self.source, "source", self.domain_name())?;
        if self.failure_patterns().is_empty() {
            return Err(self.invalid(format!(
                "rule for source '{}' lists no failure patterns",
                self.source
            )));
        }
        if self.policy_names().is_empty() {
            return Err(self.invalid(format!(
                "rule for failures '{}' lists no policies",
                self.failures
            )));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "transient_failures"
    }
}

impl Validatable for NamedPolicy {
    fn validate(&self) -> ConfigResult<()> {
        use keystone_core::PolicyDefinition as P;

        let domain = self.domain_name();
        require_non_blank(&self.name, "name", domain)?;

        match &self.definition {
            P::Retry { count } => require_positive(*count, "count", domain),
            P::RetryWithWait { count, wait } => {
                require_positive(*count, "count", domain)?;
                require_positive(wait.as_millis(), "wait", domain)
            }
            P::RetryExponentialBackoff { count, factor } => {
                require_positive(*count, "count", domain)?;
                require_positive(*factor, "factor", domain)
            }
            P::Timeout { timeout, .. } => require_positive(timeout.as_millis(), "timeout", domain),
            P::CircuitBreaker {
                failures_allowed,
                break_duration,
            } => {
                require_positive(*failures_allowed, "failures_allowed", domain)?;
                require_positive(break_duration.as_millis(), "break_duration", domain)
            }
            P::AdvancedCircuitBreaker {
                failure_threshold,
                sampling,
                min_throughput,
                break_duration,
            } => {
                if !(*failure_threshold > 0.0 && *failure_threshold <= 1.0) {
                    return Err(self.invalid(format!(
                        "failure_threshold of '{}' must be in (0, 1], got {}",
                        self.name, failure_threshold
                    )));
                }
                require_positive(sampling.as_millis(), "sampling", domain)?;
                require_positive(*min_throughput, "min_throughput", domain)?;
                require_positive(break_duration.as_millis(), "break_duration", domain)
            }
            P::Fallback => Ok(()),
        }
    }

    fn domain_name(&self) -> &'static str {
        "policies"
    }
}

impl Validatable for PolicyTableConfig {
    fn validate(&self) -> ConfigResult<()> {
        for entry in &self.transient_failures {
            entry.validate()?;
        }

        for (index, policy) in self.policies.iter().enumerate() {
            policy.validate()?;
            if self.policies[..index].iter().any(|p| p.answers_to(&policy.name)) {
                return Err(self.invalid(format!(
                    "policy '{}' is declared more than once",
                    policy.name
                )));
            }
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "policy_table"
    }
}
