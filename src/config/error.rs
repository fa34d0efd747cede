//! Configuration error types

use thiserror::Error;

/// Errors that can occur during configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration loading failed: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Validation failed: {0}")]
    ValidationFailed(#[from] ValidationError),
}

/// Errors that can occur during configuration validation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required configuration missing: {0}")]
    MissingRequired(&'static str),

    #[error("Invalid port number")]
    InvalidPort,

    #[error("Invalid bind address: {0}")]
    InvalidBindAddress(String),

    #[error("Invalid Redis URL format")]
    InvalidRedisUrl,

    #[error("Token secret must be at least {0} characters")]
    TokenSecretTooShort(usize),

    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),

    #[error("Reconnect backoff max must not be below its initial delay")]
    InvalidBackoff,

    #[error("Pong wait must exceed zero and be longer than the write wait")]
    InvalidPongWait,
}
