/*!
 * Error types for the ZigBridge core crate.
 */
use thiserror::Error;

/// Error type for ZigBridge core operations
///
/// Every variant carries a rendered message rather than the source error so the
/// type stays `Clone`; a single failure is frequently handed to several waiters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistent storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Runtime error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for ZigBridge core operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new configuration error
    pub fn config<S: AsRef<str>>(msg: S) -> Self {
        Error::Config(msg.as_ref().to_string())
    }

    /// Create a new storage error
    pub fn storage<S: AsRef<str>>(msg: S) -> Self {
        Error::Storage(msg.as_ref().to_string())
    }

    /// Create a new runtime error
    pub fn runtime<S: AsRef<str>>(msg: S) -> Self {
        Error::Runtime(msg.as_ref().to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}
