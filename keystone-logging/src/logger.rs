//! Logger collaborator

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;

/// Severity of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Info => log::Level::Info,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Error => log::Level::Error,
        }
    }
}

/// Logging capabilities every component is handed
pub trait Logger: Send + Sync {
    /// Report a failure, with its cause when there is one
    fn error(&self, cause: Option<&(dyn StdError + 'static)>, message: &str);

    fn warn(&self, message: &str);

    fn info(&self, message: &str);

    fn debug(&self, _message: &str) {}
}

/// Logger forwarding to the `log` crate under a fixed target
#[derive(Debug, Clone)]
pub struct LogFacade {
    target: String,
}

impl LogFacade {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl Logger for LogFacade {
    fn error(&self, cause: Option<&(dyn StdError + 'static)>, message: &str) {
        match cause {
            Some(cause) => log::error!(target: self.target.as_str(), "{}: {}", message, render_chain(cause)),
            None => log::error!(target: self.target.as_str(), "{}", message),
        }
    }

    fn warn(&self, message: &str) {
        log::warn!(target: self.target.as_str(), "{}", message);
    }

    fn info(&self, message: &str) {
        log::info!(target: self.target.as_str(), "{}", message);
    }

    fn debug(&self, message: &str) {
        log::debug!(target: self.target.as_str(), "{}", message);
    }
}

/// Render an error and its causes as `outer <- inner <- root`
pub fn render_chain(error: &(dyn StdError + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut current = error.source();
    let mut depth = 0;
    while let Some(cause) = current {
        // Guard against sources that point back at themselves
        if depth >= 32 {
            rendered.push_str(" <- ...");
            break;
        }
        rendered.push_str(" <- ");
        rendered.push_str(&cause.to_string());
        current = cause.source();
        depth += 1;
    }
    rendered
}

/// A recorded log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub cause: Option<String>,
}

/// Logger keeping every entry in memory
#[derive(Debug, Default)]
pub struct MemoryLogger {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all entries so far
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Entries recorded at exactly `level`
    pub fn at_level(&self, level: LogLevel) -> Vec<LogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.level == level)
            .cloned()
            .collect()
    }

    /// Whether any entry at `level` mentions `needle`
    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|e| e.level == level && e.message.contains(needle))
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    fn record(&self, level: LogLevel, message: &str, cause: Option<String>) {
        self.entries.lock().push(LogEntry {
            level,
            message: message.to_string(),
            cause,
        });
    }
}

impl Logger for MemoryLogger {
    fn error(&self, cause: Option<&(dyn StdError + 'static)>, message: &str) {
        self.record(LogLevel::Error, message, cause.map(render_chain));
    }

    fn warn(&self, message: &str) {
        self.record(LogLevel::Warn, message, None);
    }

    fn info(&self, message: &str) {
        self.record(LogLevel::Info, message, None);
    }

    fn debug(&self, message: &str) {
        self.record(LogLevel::Debug, message, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Chained {
        message: &'static str,
        source: Option<Box<Chained>>,
    }

    impl fmt::Display for Chained {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.message)
        }
    }

    impl StdError for Chained {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            self.source.as_deref().map(|s| s as &(dyn StdError + 'static))
        }
    }

    #[test]
    fn test_render_chain() {
        let error = Chained {
            message: "save failed",
            source: Some(Box::new(Chained {
                message: "connection reset",
                source: None,
            })),
        };
        assert_eq!(render_chain(&error), "save failed <- connection reset");
    }

    #[test]
    fn test_memory_logger_records_levels() {
        let logger = MemoryLogger::new();
        logger.info("starting");
        logger.warn("policy missing");
        logger.error(None, "boom");

        assert_eq!(logger.entries().len(), 3);
        assert!(logger.contains(LogLevel::Warn, "policy"));
        assert!(!logger.contains(LogLevel::Info, "policy"));
        assert_eq!(logger.at_level(LogLevel::Error)[0].cause, None);

        logger.clear();
        assert!(logger.entries().is_empty());
    }

    #[test]
    fn test_entry_serialization() {
        let entry = LogEntry {
            level: LogLevel::Warn,
            message: "degraded".to_string(),
            cause: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"warn\""));
    }
}
