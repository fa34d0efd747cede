//! Application configuration module
//!
//! This module provides type-safe configuration loading from environment variables
//! using the `config` and `dotenvy` crates. Configuration is loaded with the
//! `CONNECT_LIVE` prefix and nested values are separated by double underscores.
//!
//! # Example
//!
//! ```no_run
//! use connect_live::config::AppConfig;
//!
//! let config = AppConfig::load().expect("Failed to load configuration");
//! config.validate().expect("Invalid configuration");
//! ```

mod auth;
mod error;
mod live;
mod redis;
mod server;

pub use auth::{AuthConfig, MIN_TOKEN_SECRET_LEN};
pub use error::{ConfigError, ValidationError};
pub use live::LiveConfig;
pub use redis::RedisConfig;
pub use server::{Environment, ServerConfig};

use serde::Deserialize;

/// Root application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server configuration (host, port, environment)
    #[serde(default)]
    pub server: ServerConfig,

    /// Redis configuration (pub/sub event bus)
    #[serde(default)]
    pub redis: RedisConfig,

    /// Authentication configuration (token secret)
    pub auth: AuthConfig,

    /// Live layer configuration (limits, timeouts, broker choice)
    #[serde(default)]
    pub live: LiveConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    ///
    /// This function:
    /// 1. Loads `.env` file if present (for development)
    /// 2. Reads environment variables with `CONNECT_LIVE` prefix
    /// 3. Uses `__` (double underscore) to separate nested values
    /// 4. Deserializes into typed configuration structs
    ///
    /// # Environment Variable Format
    ///
    /// - `CONNECT_LIVE__SERVER__PORT=8080` -> `server.port = 8080`
    /// - `CONNECT_LIVE__REDIS__URL=...` -> `redis.url = ...`
    /// - `CONNECT_LIVE__LIVE__MAX_CONNECTIONS_PER_USER=5` -> `live.max_connections_per_user = 5`
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .prefix("CONNECT_LIVE")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.server.validate()?;
        self.redis.validate()?;
        self.auth.validate()?;
        self.live.validate()?;
        Ok(())
    }

    /// Redis URL to use, or `None` when the in-process broker applies.
    pub fn redis_url(&self) -> Option<&str> {
        if self.live.use_memory_broker {
            return None;
        }
        self.redis.url()
    }

    /// Check if running in production environment
    pub fn is_production(&self) -> bool {
        self.server.is_production()
    }
}
