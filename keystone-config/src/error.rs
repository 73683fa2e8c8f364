//! Configuration error types

use thiserror::Error;

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or resolving the policy table
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The table file could not be read
    #[error("Failed to read policy table: {0}")]
    FileReadError(#[from] std::io::Error),

    /// The table is not valid YAML or does not match the table layout
    #[error("Failed to parse policy table: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// The table path variable is set but unusable
    #[error("Policy table environment override is invalid: {0}")]
    EnvError(String),

    /// A table section is invalid or cannot be resolved
    #[error("Invalid {domain} section: {message}")]
    DomainError { domain: String, message: String },
}
