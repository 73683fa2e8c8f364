//! Transaction error types

use keystone_core::{Failure, FailureKind};
use thiserror::Error;

/// Transaction result type
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Transaction errors
#[derive(Error, Debug)]
pub enum TransactionError {
    /// The coordinator was used against its contract; never swallowed
    #[error("Transaction usage error: {0}")]
    Usage(String),

    /// A queued operation, or completing the scope, failed
    #[error("Commit failed for the current transaction: {cause}")]
    Commit {
        #[source]
        cause: Failure,
    },

    /// Releasing the scope failed
    #[error("Rollback failed for the current transaction: {cause}")]
    Rollback {
        #[source]
        cause: Failure,
    },

    /// Commit failed and so did the rollback that followed
    #[error("Both commit and rollback failed for the current transaction: {commit}; {rollback}")]
    Aggregate {
        #[source]
        commit: Failure,
        rollback: Failure,
    },
}

impl TransactionError {
    pub fn usage(message: impl Into<String>) -> Self {
        TransactionError::Usage(message.into())
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, TransactionError::Usage(_))
    }

    /// Failure that made the commit fail, if any
    pub fn commit_failure(&self) -> Option<&Failure> {
        match self {
            TransactionError::Commit { cause } => Some(cause),
            TransactionError::Aggregate { commit, .. } => Some(commit),
            _ => None,
        }
    }

    /// Failure raised while releasing the scope, if any
    pub fn rollback_failure(&self) -> Option<&Failure> {
        match self {
            TransactionError::Rollback { cause } => Some(cause),
            TransactionError::Aggregate { rollback, .. } => Some(rollback),
            _ => None,
        }
    }
}

impl From<TransactionError> for Failure {
    /// Keeps the kind of the failure that broke the commit so that a
    /// transaction can be retried by the resilience layer
    fn from(error: TransactionError) -> Self {
        let kind = error
            .commit_failure()
            .or_else(|| error.rollback_failure())
            .map(Failure::kind)
            .unwrap_or(FailureKind::Internal);
        Failure::new(kind, error.to_string()).with_source(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_failure_kind_survives_conversion() {
        let error = TransactionError::Commit {
            cause: Failure::new(FailureKind::Deadlock, "victim"),
        };
        let failure = Failure::from(error);
        assert_eq!(failure.kind(), FailureKind::Deadlock);
        assert!(std::error::Error::source(&failure).is_some());
    }

    #[test]
    fn test_usage_error_becomes_internal() {
        let failure = Failure::from(TransactionError::usage("empty queue"));
        assert_eq!(failure.kind(), FailureKind::Internal);
    }
}
