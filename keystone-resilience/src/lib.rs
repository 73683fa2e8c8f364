//! Resilient execution for Keystone
//!
//! Failures raised by a unit of work are classified against the
//! transient-failure catalog. Transient ones are re-run through a chain of
//! retry, timeout, circuit-breaker and fallback policies composed for that
//! one failure occurrence.
//!
//! ```no_run
//! use keystone_core::{Failure, PolicyDefinition};
//! use keystone_logging::default_logger;
//! use keystone_resilience::{CatalogSource, LazyPolicyCatalog, PolicySet, ResilientExecutor};
//! use std::sync::Arc;
//!
//! let logger = default_logger();
//! let catalog = Arc::new(LazyPolicyCatalog::new(CatalogSource::Embedded, logger.clone()));
//! let policies = PolicySet::new().with(PolicyDefinition::Retry { count: 3 });
//! let executor = ResilientExecutor::new(catalog, policies, logger);
//!
//! let saved = executor.execute_blocking(|| Ok::<_, Failure>("saved"), None);
//! ```

pub mod backoff;
pub mod catalog;
pub mod chain;
pub mod circuit_breaker;
pub mod classifier;
pub mod composer;
pub mod error;
pub mod executor;
pub mod policy_set;
pub mod work;

pub use backoff::{BackoffCalculator, BackoffStrategy};
pub use catalog::{CatalogSource, LazyPolicyCatalog, PolicyCatalog, TransientFailureRule};
pub use chain::{ChainOutcome, PolicyChain};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use classifier::{Classification, ExceptionClassifier};
pub use composer::{Composition, PolicyComposer};
pub use error::{ResilienceError, ResilienceResult};
pub use executor::ResilientExecutor;
pub use policy_set::PolicySet;
pub use work::{Compensation, Deferred, Work};
