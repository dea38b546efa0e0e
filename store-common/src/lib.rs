//! Error taxonomy and logging setup for the market store tools

pub mod error;
pub mod logging;

pub use error::{ConfigurationError, ErrorCategory, ErrorClassification, NetworkError};
pub use logging::{init_logging, LogConfig, LogFormat, TimestampFormat};
