//! Failure taxonomy
//!
//! Every condition raised by a unit of work is a [`Failure`] tagged with a
//! closed [`FailureKind`]. Classification matches on the tag, never on type
//! names, and the stable identifiers below are what transient-failure tables
//! refer to.

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::io;
use thiserror::Error;

/// Boxed error used as the cause of a [`Failure`]
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result type alias for fallible units of work
pub type Result<T> = std::result::Result<T, Failure>;

/// Closed set of failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// File or stream I/O failed
    Io,
    /// An operation exceeded its time budget
    Timeout,
    /// A connection could not be established or was dropped
    Connection,
    /// A downstream dependency is temporarily unavailable
    Unavailable,
    /// The storage engine rejected a statement
    Database,
    /// The storage engine chose this transaction as a deadlock victim
    Deadlock,
    /// Optimistic concurrency check failed
    Concurrency,
    /// A circuit breaker rejected the call
    CircuitOpen,
    /// The caller cancelled the operation
    Cancelled,
    /// Input failed validation
    Validation,
    /// A requested entity does not exist
    NotFound,
    /// The caller lacks permission
    Unauthorized,
    /// Anything else
    Internal,
}

impl FailureKind {
    /// All kinds, in declaration order
    pub const ALL: [FailureKind; 13] = [
        FailureKind::Io,
        FailureKind::Timeout,
        FailureKind::Connection,
        FailureKind::Unavailable,
        FailureKind::Database,
        FailureKind::Deadlock,
        FailureKind::Concurrency,
        FailureKind::CircuitOpen,
        FailureKind::Cancelled,
        FailureKind::Validation,
        FailureKind::NotFound,
        FailureKind::Unauthorized,
        FailureKind::Internal,
    ];

    /// Stable identifier used by transient-failure tables
    pub fn identifier(self) -> &'static str {
        match self {
            FailureKind::Io => "IOFailure",
            FailureKind::Timeout => "TimeoutFailure",
            FailureKind::Connection => "ConnectionFailure",
            FailureKind::Unavailable => "UnavailableFailure",
            FailureKind::Database => "DatabaseFailure",
            FailureKind::Deadlock => "DeadlockFailure",
            FailureKind::Concurrency => "ConcurrencyFailure",
            FailureKind::CircuitOpen => "CircuitOpenFailure",
            FailureKind::Cancelled => "CancelledFailure",
            FailureKind::Validation => "ValidationFailure",
            FailureKind::NotFound => "NotFoundFailure",
            FailureKind::Unauthorized => "UnauthorizedFailure",
            FailureKind::Internal => "InternalFailure",
        }
    }

    /// Namespace the kind belongs to, used as the source qualifier of table rules
    pub fn namespace(self) -> &'static str {
        match self {
            FailureKind::Io => "io",
            FailureKind::Timeout | FailureKind::Connection | FailureKind::Unavailable => "net",
            FailureKind::Database | FailureKind::Deadlock | FailureKind::Concurrency => "storage",
            FailureKind::CircuitOpen | FailureKind::Cancelled => "resilience",
            FailureKind::Validation
            | FailureKind::NotFound
            | FailureKind::Unauthorized
            | FailureKind::Internal => "domain",
        }
    }

    /// Whether a case-insensitive substring pattern selects this kind
    pub fn matches_pattern(self, pattern: &str) -> bool {
        let pattern = pattern.trim().to_lowercase();
        !pattern.is_empty() && self.identifier().to_lowercase().contains(&pattern)
    }

    /// Tag an arbitrary error found in a cause chain, if it is one we know
    pub fn of_error(error: &(dyn StdError + 'static)) -> Option<FailureKind> {
        if let Some(failure) = error.downcast_ref::<Failure>() {
            return Some(failure.kind());
        }
        if let Some(io_error) = error.downcast_ref::<io::Error>() {
            return Some(Self::from_io_kind(io_error.kind()));
        }
        if error.is::<tokio::time::error::Elapsed>() {
            return Some(FailureKind::Timeout);
        }
        None
    }

    fn from_io_kind(kind: io::ErrorKind) -> FailureKind {
        match kind {
            io::ErrorKind::TimedOut => FailureKind::Timeout,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => FailureKind::Connection,
            _ => FailureKind::Io,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

/// A raised failure: kind tag, message and optional cause
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct Failure {
    kind: FailureKind,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl Failure {
    /// Create a failure without a cause
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach a cause
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Io, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(FailureKind::CircuitOpen, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }

    /// Kind tag of this failure (not of its causes)
    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    /// Human readable message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<io::Error> for Failure {
    fn from(error: io::Error) -> Self {
        Failure::new(FailureKind::from_io_kind(error.kind()), error.to_string()).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for Failure {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Failure::timeout(error.to_string()).with_source(error)
    }
}
