//! Authentication adapters.
//!
//! Implementations of the `TokenVerifier` and `ChannelAuthorizer` ports:
//!
//! - `jwt` - HS256 verifier using the shared token secret
//! - `channel_guard` - Keeps `user:` channels private to their owner
//! - `mock` - Test implementations that don't require external services

mod channel_guard;
mod jwt;
mod mock;

pub use channel_guard::UserChannelGuard;
pub use jwt::JwtTokenVerifier;
pub use mock::{MockChannelAuthorizer, MockTokenVerifier};
