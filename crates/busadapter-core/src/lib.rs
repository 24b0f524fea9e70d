//! `busadapter` Core Library
//!
//! Shared functionality for the adapter and bridge daemons:
//! - Log levels and the `Logger` capability
//! - Configuration resolution from the environment
//! - Common error types
//! - Tracing initialisation

pub mod config;
pub mod error;
pub mod level;
pub mod logging;
pub mod tracing_init;

pub use config::{Credentials, Settings};
pub use error::{Error, Result};
pub use level::LogLevel;
pub use logging::{ConsoleLogger, LogRecord, Logger};
