//! Console output for the records keystone emits through `log`

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Variable holding a filter such as `keystone=debug`
pub const LOG_FILTER_ENV: &str = "KEYSTONE_LOG";

/// Install a console subscriber for keystone's log records
///
/// A filter in `KEYSTONE_LOG` wins over `default_filter`. Returns `false`
/// when another subscriber was installed first; that one stays in place.
pub fn init_tracing(default_filter: &str) -> Result<bool> {
    let filter = match std::env::var(LOG_FILTER_ENV) {
        Ok(value) if !value.trim().is_empty() => EnvFilter::try_new(&value)
            .with_context(|| format!("{} holds an invalid filter '{}'", LOG_FILTER_ENV, value))?,
        _ => EnvFilter::try_new(default_filter)
            .with_context(|| format!("invalid default log filter '{}'", default_filter))?,
    };

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok();
    if !installed {
        tracing::debug!("A tracing subscriber is already installed, keeping it");
    }
    Ok(installed)
}
