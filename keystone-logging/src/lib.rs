//! Logging for Keystone
//!
//! Components receive an `Arc<dyn Logger>` at construction. Production code
//! uses [`LogFacade`], which forwards to the `log` crate; tests use
//! [`MemoryLogger`] to assert on what was reported.

pub mod init;
pub mod logger;

pub use init::{init_tracing, LOG_FILTER_ENV};
pub use logger::{render_chain, LogEntry, LogFacade, LogLevel, Logger, MemoryLogger};

use std::sync::Arc;

/// Shared handle to the default `log` facade logger
pub fn default_logger() -> Arc<dyn Logger> {
    Arc::new(LogFacade::new("keystone"))
}
