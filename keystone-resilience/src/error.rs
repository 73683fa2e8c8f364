//! Resilience error types

use keystone_config::ConfigError;
use keystone_core::Failure;
use std::sync::Arc;
use thiserror::Error;

/// Result type for resilient execution
pub type ResilienceResult<T> = Result<T, ResilienceError>;

#[derive(Debug, Error)]
pub enum ResilienceError {
    /// The transient-failure table could not be built
    #[error("Policy catalog configuration error: {error}")]
    Configuration {
        #[source]
        error: Arc<ConfigError>,
        /// The failure that needed the catalog, when a unit of work failed
        cause: Option<Failure>,
    },

    /// The unit of work failed and nothing recovered it
    #[error("Unit of work failed, check the inner failure: {cause}")]
    Execution {
        /// The failure raised by the first invocation
        #[source]
        cause: Failure,
        /// Last failure raised while the policy chain ran, if it ran
        secondary: Option<Failure>,
        /// Failure raised by the compensating action, if it ran and failed
        compensation: Option<Failure>,
    },
}

impl ResilienceError {
    /// The failure raised by the unit of work, if one was
    pub fn cause(&self) -> Option<&Failure> {
        match self {
            ResilienceError::Execution { cause, .. } => Some(cause),
            ResilienceError::Configuration { cause, .. } => cause.as_ref(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, ResilienceError::Configuration { .. })
    }

    /// Attach the failure that was being handled when the catalog failed
    pub(crate) fn with_cause(self, failure: Failure) -> Self {
        match self {
            ResilienceError::Configuration { error, .. } => ResilienceError::Configuration {
                error,
                cause: Some(failure),
            },
            other => other,
        }
    }
}
