//! Configuration for the Keystone resilience layer
//!
//! The transient-failure table tells the resilience layer which failures are
//! worth retrying and which named policies to wrap around them. It is loaded
//! from a YAML document, either a file or the table embedded in this crate.

pub mod error;
pub mod loader;
pub mod table;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::PolicyTableLoader;
pub use table::{split_comma_separated, PolicyTableConfig, TransientFailureEntry};
pub use validation::Validatable;
