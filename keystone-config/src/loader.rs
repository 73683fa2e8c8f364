//! Policy table loading and environment variable handling

use crate::error::{ConfigError, ConfigResult};
use crate::table::PolicyTableConfig;
use crate::validation::Validatable;
use std::path::{Path, PathBuf};

/// Table compiled into the crate, used when no file is configured
pub const EMBEDDED_TABLE: &str = include_str!("../resources/transient_failures.yaml");

/// Policy table loader with environment variable support
pub struct PolicyTableLoader {
    /// Environment variable prefix
    prefix: String,
}

impl PolicyTableLoader {
    /// Create a new loader with the default `KEYSTONE` prefix
    pub fn new() -> Self {
        Self {
            prefix: "KEYSTONE".to_string(),
        }
    }

    /// Create a new loader with a custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load and validate a table from a YAML file
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<PolicyTableConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let table = self.from_yaml(&content)?;
        log::info!(
            "Loaded policy table from {} ({} rules, {} policies)",
            path.display(),
            table.transient_failures.len(),
            table.policies.len()
        );
        Ok(table)
    }

    /// Parse and validate a table from YAML text
    pub fn from_yaml(&self, content: &str) -> ConfigResult<PolicyTableConfig> {
        let table: PolicyTableConfig = serde_yaml::from_str(content)?;
        table.validate()?;
        Ok(table)
    }

    /// Parse the table embedded in this crate
    pub fn embedded(&self) -> ConfigResult<PolicyTableConfig> {
        log::debug!("Loading embedded policy table");
        self.from_yaml(EMBEDDED_TABLE)
    }

    /// Load with fallback chain: explicit path, then `<PREFIX>_POLICY_TABLE`,
    /// then the embedded table
    pub fn load(&self, table_path: Option<impl AsRef<Path>>) -> ConfigResult<PolicyTableConfig> {
        if let Some(path) = table_path {
            return self.from_file(path);
        }
        match self.env_table_path()? {
            Some(path) => self.from_file(path),
            None => self.embedded(),
        }
    }

    /// Path named by `<PREFIX>_POLICY_TABLE`, if set
    pub fn env_table_path(&self) -> ConfigResult<Option<PathBuf>> {
        match self.get_env_var("POLICY_TABLE") {
            Ok(value) if value.trim().is_empty() => Err(ConfigError::EnvError(format!(
                "{}_POLICY_TABLE is set but empty",
                self.prefix
            ))),
            Ok(value) => Ok(Some(PathBuf::from(value.trim()))),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(ConfigError::EnvError(format!(
                "Invalid {}_POLICY_TABLE: {}",
                self.prefix, e
            ))),
        }
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for PolicyTableLoader {
    fn default() -> Self {
        Self::new()
    }
}
