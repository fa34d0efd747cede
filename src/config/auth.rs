//! Authentication configuration

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::error::ValidationError;

/// Minimum length of the HS256 token secret.
pub const MIN_TOKEN_SECRET_LEN: usize = 32;

/// Authentication configuration (shared-secret JWT)
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HS256 signing secret shared with the token issuer
    pub token_secret: SecretString,

    /// Tolerated clock skew in seconds when checking `exp`
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,
}

impl AuthConfig {
    /// Validate authentication configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        let secret = self.token_secret.expose_secret();
        if secret.is_empty() {
            return Err(ValidationError::MissingRequired("AUTH__TOKEN_SECRET"));
        }
        if secret.len() < MIN_TOKEN_SECRET_LEN {
            return Err(ValidationError::TokenSecretTooShort(MIN_TOKEN_SECRET_LEN));
        }
        Ok(())
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: SecretString::new(String::new()),
            leeway_secs: default_leeway(),
        }
    }
}

fn default_leeway() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_missing_secret() {
        let config = AuthConfig::default();
        assert_eq!(
            config.validate(),
            Err(ValidationError::MissingRequired("AUTH__TOKEN_SECRET"))
        );
    }

    #[test]
    fn test_validation_short_secret() {
        let config = AuthConfig {
            token_secret: SecretString::new("short".to_string()),
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ValidationError::TokenSecretTooShort(MIN_TOKEN_SECRET_LEN))
        );
    }

    #[test]
    fn test_validation_valid_secret() {
        let config = AuthConfig {
            token_secret: SecretString::new("x".repeat(MIN_TOKEN_SECRET_LEN)),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = AuthConfig {
            token_secret: SecretString::new("super-secret-value-that-is-long-enough".to_string()),
            ..Default::default()
        };
        assert!(!format!("{:?}", config).contains("super-secret"));
    }
}
