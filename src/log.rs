//! Structured logging seam for the runtime.
//!
//! The interpreter emits [`LogEntry`] values (from `Effect::log` nodes and
//! from unhandled-failure reporting) to the loggers configured on the
//! runtime. No output goes to stdout/stderr directly; the default
//! configuration bridges to the `tracing` crate via [`TracingLogger`], and
//! tests capture entries with [`CollectingLogger`].

use crate::types::FiberId;
use core::fmt;
use parking_lot::Mutex;

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// Fine-grained interpreter diagnostics.
    Trace,
    /// Debugging information, including unhandled-failure reports.
    Debug,
    /// General informational messages.
    Info,
    /// Conditions worth attention.
    Warn,
    /// Errors.
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A structured log entry produced by a fiber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Severity of the entry.
    pub level: LogLevel,
    /// Rendered message.
    pub message: String,
    /// The fiber that produced the entry.
    pub fiber: FiberId,
}

/// Sink for log entries.
pub trait Logger: Send + Sync + 'static {
    /// Records one entry.
    fn log(&self, entry: &LogEntry);
}

/// Logger that stores entries in memory, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct CollectingLogger {
    entries: Mutex<Vec<LogEntry>>,
}

impl CollectingLogger {
    /// Creates an empty collecting logger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all recorded entries.
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Returns the messages recorded at or above `level`.
    #[must_use]
    pub fn messages_at(&self, level: LogLevel) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.level >= level)
            .map(|e| e.message.clone())
            .collect()
    }
}

impl Logger for CollectingLogger {
    fn log(&self, entry: &LogEntry) {
        self.entries.lock().push(entry.clone());
    }
}

/// Logger that forwards entries to the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, entry: &LogEntry) {
        let fiber = entry.fiber;
        match entry.level {
            LogLevel::Trace => tracing::trace!(fiber = %fiber, "{}", entry.message),
            LogLevel::Debug => tracing::debug!(fiber = %fiber, "{}", entry.message),
            LogLevel::Info => tracing::info!(fiber = %fiber, "{}", entry.message),
            LogLevel::Warn => tracing::warn!(fiber = %fiber, "{}", entry.message),
            LogLevel::Error => tracing::error!(fiber = %fiber, "{}", entry.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn collecting_logger_filters_by_level() {
        let logger = CollectingLogger::new();
        let fiber = FiberId::new_for_test(1);
        logger.log(&LogEntry {
            level: LogLevel::Debug,
            message: "low".into(),
            fiber,
        });
        logger.log(&LogEntry {
            level: LogLevel::Warn,
            message: "high".into(),
            fiber,
        });
        assert_eq!(logger.messages_at(LogLevel::Info), vec!["high".to_string()]);
        assert_eq!(logger.entries().len(), 2);
    }
}
