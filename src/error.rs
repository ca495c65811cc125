//! Error types for the Gatekeeper service.

use thiserror::Error;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// The shared counter store failed or timed out
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// The caller identity is empty or malformed
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Ratelimiter options rejected at construction
    #[error("Invalid ratelimiter configuration: {0}")]
    ConfigInvalid(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for GatekeeperError {
    fn from(err: redis::RedisError) -> Self {
        GatekeeperError::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for GatekeeperError {
    fn from(err: serde_json::Error) -> Self {
        GatekeeperError::StoreUnavailable(format!("corrupt ban record: {}", err))
    }
}

impl From<config::ConfigError> for GatekeeperError {
    fn from(err: config::ConfigError) -> Self {
        GatekeeperError::Config(err.to_string())
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
