//! Validation of policy table entries

use crate::error::{ConfigError, ConfigResult};

/// A table section that can check itself before the catalog is built
pub trait Validatable {
    fn validate(&self) -> ConfigResult<()>;

    /// Table section named in errors, e.g. `transient_failures`
    fn domain_name(&self) -> &'static str;

    fn invalid(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::DomainError {
            domain: self.domain_name().to_string(),
            message: message.into(),
        }
    }
}

/// Reject names and sources that are empty once trimmed
pub fn require_non_blank(value: &str, field: &str, domain: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("'{}' is missing or blank", field),
        });
    }
    Ok(())
}

/// Reject counts and durations of zero
pub fn require_positive<T>(value: T, field: &str, domain: &str) -> ConfigResult<()>
where
    T: PartialOrd + Default + std::fmt::Display,
{
    if value > T::default() {
        return Ok(());
    }
    Err(ConfigError::DomainError {
        domain: domain.to_string(),
        message: format!("'{}' has to be positive, found {}", field, value),
    })
}
