//! Transient-failure catalog
//!
//! [`PolicyCatalog`] is the resolved form of the policy table: every failure
//! pattern is turned into the set of [`FailureKind`]s it selects, once, when
//! the catalog is built. [`LazyPolicyCatalog`] owns the one-time build and is
//! shared by `Arc` between executors.

use keystone_config::{ConfigError, ConfigResult, PolicyTableConfig, PolicyTableLoader, Validatable};
use keystone_core::{FailureKind, NamedPolicy};
use keystone_logging::Logger;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{ResilienceError, ResilienceResult};

/// Source qualifier matching every namespace
pub const ANY_SOURCE: &str = "*";

/// A resolved transient-failure rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransientFailureRule {
    /// Namespace qualifier as written in the table
    pub source: String,
    /// Lower-cased patterns as written in the table
    pub patterns: Vec<String>,
    /// Kinds selected by the patterns
    pub kinds: Vec<FailureKind>,
    /// Policy names, in declaration order
    pub policy_names: Vec<String>,
}

/// Immutable table of transient-failure rules
#[derive(Debug, Clone, Default)]
pub struct PolicyCatalog {
    rules: Vec<TransientFailureRule>,
    index: HashMap<FailureKind, usize>,
    declared_policies: Vec<NamedPolicy>,
}

impl PolicyCatalog {
    /// Resolve a validated table
    pub fn from_table(table: &PolicyTableConfig) -> ConfigResult<Self> {
        table.validate()?;

        let mut rules = Vec::with_capacity(table.transient_failures.len());
        let mut index = HashMap::new();

        for entry in &table.transient_failures {
            let source = entry.source.trim().to_lowercase();
            let in_scope: Vec<FailureKind> = FailureKind::ALL
                .iter()
                .copied()
                .filter(|kind| source == ANY_SOURCE || kind.namespace() == source)
                .collect();
            if in_scope.is_empty() {
                return Err(domain_error(format!(
                    "unknown source namespace '{}'",
                    entry.source
                )));
            }

            let patterns = entry.failure_patterns();
            let mut kinds = Vec::new();
            for pattern in &patterns {
                let matched: Vec<FailureKind> = in_scope
                    .iter()
                    .copied()
                    .filter(|kind| kind.matches_pattern(pattern))
                    .collect();
                if matched.is_empty() {
                    return Err(domain_error(format!(
                        "pattern '{}' matches no failure in source '{}'",
                        pattern, entry.source
                    )));
                }
                for kind in matched {
                    if !kinds.contains(&kind) {
                        kinds.push(kind);
                    }
                }
            }

            let rule_index = rules.len();
            for kind in &kinds {
                if let Some(previous) = index.insert(*kind, rule_index) {
                    if previous != rule_index {
                        return Err(domain_error(format!(
                            "{} is claimed by more than one rule",
                            kind.identifier()
                        )));
                    }
                }
            }

            rules.push(TransientFailureRule {
                source: entry.source.trim().to_string(),
                patterns,
                kinds,
                policy_names: entry.policy_names(),
            });
        }

        Ok(Self {
            rules,
            index,
            declared_policies: table.policies.clone(),
        })
    }

    pub fn rules(&self) -> &[TransientFailureRule] {
        &self.rules
    }

    /// The rule covering `kind`, if any
    pub fn rule_for(&self, kind: FailureKind) -> Option<&TransientFailureRule> {
        self.index.get(&kind).map(|i| &self.rules[*i])
    }

    /// Ordered policy names for `kind`; empty when the kind is not transient
    pub fn rules_for(&self, kind: FailureKind) -> &[String] {
        self.rule_for(kind)
            .map(|rule| rule.policy_names.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_transient(&self, kind: FailureKind) -> bool {
        self.index.contains_key(&kind)
    }

    /// Whether the table lists any transient failure at all
    pub fn has_rules(&self) -> bool {
        !self.index.is_empty()
    }

    /// Policies declared in the table's `policies` section
    pub fn declared_policies(&self) -> &[NamedPolicy] {
        &self.declared_policies
    }
}

fn domain_error(message: String) -> ConfigError {
    ConfigError::DomainError {
        domain: "transient_failures".to_string(),
        message,
    }
}

/// Where the policy table comes from
#[derive(Debug, Clone)]
pub enum CatalogSource {
    /// Table compiled into `keystone-config`
    Embedded,
    /// Explicit path, then `KEYSTONE_POLICY_TABLE`, then the embedded table
    Environment,
    /// A YAML file
    File(PathBuf),
    /// YAML text
    Yaml(String),
    /// An already parsed table
    Table(PolicyTableConfig),
}

/// Catalog built once, on first use, no matter how many callers race for it
///
/// A failed build is cached too: every caller observes the same
/// configuration error and the table is never re-read.
pub struct LazyPolicyCatalog {
    source: CatalogSource,
    loader: PolicyTableLoader,
    cell: OnceCell<Result<Arc<PolicyCatalog>, Arc<ConfigError>>>,
    builds: AtomicUsize,
    logger: Arc<dyn Logger>,
}

impl LazyPolicyCatalog {
    pub fn new(source: CatalogSource, logger: Arc<dyn Logger>) -> Self {
        Self::with_loader(source, PolicyTableLoader::new(), logger)
    }

    /// Use a loader with a custom environment prefix
    pub fn with_loader(source: CatalogSource, loader: PolicyTableLoader, logger: Arc<dyn Logger>) -> Self {
        Self {
            source,
            loader,
            cell: OnceCell::new(),
            builds: AtomicUsize::new(0),
            logger,
        }
    }

    /// Get the catalog, building it if this is the first access
    pub fn get(&self) -> ResilienceResult<Arc<PolicyCatalog>> {
        self.cell
            .get_or_init(|| self.build())
            .clone()
            .map_err(|error| ResilienceError::Configuration { error, cause: None })
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }

    /// How many times the table was actually built
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    fn build(&self) -> Result<Arc<PolicyCatalog>, Arc<ConfigError>> {
        self.builds.fetch_add(1, Ordering::SeqCst);

        let table = match &self.source {
            CatalogSource::Embedded => self.loader.embedded(),
            CatalogSource::Environment => self.loader.load(None::<PathBuf>),
            CatalogSource::File(path) => self.loader.from_file(path),
            CatalogSource::Yaml(content) => self.loader.from_yaml(content),
            CatalogSource::Table(table) => Ok(table.clone()),
        };

        match table.and_then(|table| PolicyCatalog::from_table(&table)) {
            Ok(catalog) => {
                self.logger.info(&format!(
                    "Policy catalog built with {} transient-failure rules",
                    catalog.rules().len()
                ));
                Ok(Arc::new(catalog))
            }
            Err(e) => {
                self.logger.error(Some(&e), "Failed to build the policy catalog");
                Err(Arc::new(e))
            }
        }
    }
}

impl std::fmt::Debug for LazyPolicyCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyPolicyCatalog")
            .field("source", &self.source)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_config::TransientFailureEntry;
    use keystone_logging::MemoryLogger;
    use std::sync::Barrier;
    use std::thread;

    fn table(entries: &[(&str, &str, &str)]) -> PolicyTableConfig {
        PolicyTableConfig {
            transient_failures: entries
                .iter()
                .map(|(source, failures, policies)| TransientFailureEntry {
                    source: source.to_string(),
                    failures: failures.to_string(),
                    policies: policies.to_string(),
                })
                .collect(),
            policies: Vec::new(),
        }
    }

    #[test]
    fn test_patterns_resolve_to_kinds() {
        let catalog = PolicyCatalog::from_table(&table(&[
            ("io", "IOFailure", "Retry, CircuitBreaker"),
            ("*", "deadlock, TIMEOUT", "RetryWithWait"),
        ]))
        .unwrap();

        assert!(catalog.is_transient(FailureKind::Io));
        assert!(catalog.is_transient(FailureKind::Deadlock));
        assert!(catalog.is_transient(FailureKind::Timeout));
        assert!(!catalog.is_transient(FailureKind::Validation));
        assert_eq!(catalog.rules_for(FailureKind::Io), ["Retry", "CircuitBreaker"]);
        assert_eq!(catalog.rules_for(FailureKind::Timeout), ["RetryWithWait"]);
        assert!(catalog.rules_for(FailureKind::NotFound).is_empty());
    }

    #[test]
    fn test_source_restricts_resolution() {
        let err = PolicyCatalog::from_table(&table(&[("storage", "IOFailure", "Retry")])).unwrap_err();
        assert!(err.to_string().contains("matches no failure"));
    }

    #[test]
    fn test_unknown_source_is_rejected() {
        let err = PolicyCatalog::from_table(&table(&[("kernel", "IOFailure", "Retry")])).unwrap_err();
        assert!(err.to_string().contains("unknown source namespace"));
    }

    #[test]
    fn test_kind_claimed_twice_is_rejected() {
        let err = PolicyCatalog::from_table(&table(&[
            ("io", "IOFailure", "Retry"),
            ("*", "io", "RetryWithWait"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("more than one rule"));
    }

    #[test]
    fn test_lazy_catalog_builds_once_under_contention() {
        let lazy = Arc::new(LazyPolicyCatalog::new(
            CatalogSource::Embedded,
            Arc::new(MemoryLogger::new()),
        ));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lazy = lazy.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    lazy.get().map(|c| c.rules().len())
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap().unwrap() > 0);
        }
        assert_eq!(lazy.build_count(), 1);
    }

    #[test]
    fn test_lazy_catalog_caches_configuration_error() {
        let logger = Arc::new(MemoryLogger::new());
        let lazy = LazyPolicyCatalog::new(
            CatalogSource::File(PathBuf::from("/no/such/table.yaml")),
            logger.clone(),
        );

        assert!(!lazy.is_initialized());
        assert!(lazy.get().unwrap_err().is_configuration());
        assert!(lazy.get().unwrap_err().is_configuration());
        assert_eq!(lazy.build_count(), 1);
        assert_eq!(logger.entries().len(), 1);
    }
}
