//! The `Logger` capability consumed by the adapter, bridge, bus client and
//! worker, plus its console implementation.
//!
//! Loggers never fail: `log` has no return value and implementations are
//! best-effort.

use tracing::{debug, error, info, warn};

use crate::level::LogLevel;

/// A single leveled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

/// Leveled, infallible log sink.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Writes records at or above a threshold to the `tracing` subscriber.
///
/// The eight-level scale is folded onto tracing's five levels; the original
/// name is kept in the `severity` field.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleLogger {
    threshold: LogLevel,
}

impl ConsoleLogger {
    pub const fn new(threshold: LogLevel) -> Self {
        Self { threshold }
    }

    pub const fn threshold(&self) -> LogLevel {
        self.threshold
    }
}

impl Default for ConsoleLogger {
    fn default() -> Self {
        Self::new(LogLevel::Debug)
    }
}

impl Logger for ConsoleLogger {
    fn log(&self, level: LogLevel, message: &str) {
        if level.is_weaker(self.threshold) {
            return;
        }
        let severity = level.as_str();
        match level {
            LogLevel::Debug => debug!(severity, "{message}"),
            LogLevel::Info | LogLevel::Notice => info!(severity, "{message}"),
            LogLevel::Warning => warn!(severity, "{message}"),
            LogLevel::Error | LogLevel::Critical | LogLevel::Alert | LogLevel::Emergency => {
                error!(severity, "{message}");
            }
        }
    }
}

/// Keeps every record in memory for later inspection.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug, Default)]
pub struct MemoryLogger {
    records: parking_lot::Mutex<Vec<LogRecord>>,
}

#[cfg(any(test, feature = "test-utils"))]
impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records logged so far, oldest first.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Records at exactly `level`.
    pub fn at(&self, level: LogLevel) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.level == level)
            .map(|r| r.message.clone())
            .collect()
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Logger for MemoryLogger {
    fn log(&self, level: LogLevel, message: &str) {
        self.records.lock().push(LogRecord::new(level, message));
    }
}
