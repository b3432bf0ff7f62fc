//! Logging integration for hosts embedding the connection layer

pub mod logging;

pub use logging::{init_logging, LoggingConfig, LoggingGuard};
