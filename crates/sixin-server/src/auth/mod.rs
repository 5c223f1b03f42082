//! Bearer-token authentication and rate limiting.

pub mod rate_limit;

pub use rate_limit::{ServerRateLimits, StrikeCounter};

use sixin_core::{SixinError, SixinResult, UserId};

/// Validates an opaque bearer token into a user id.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> SixinResult<UserId>;
}

/// HMAC-signed tokens minted with the server secret.
pub struct TokenAuthenticator {
    secret: Vec<u8>,
    ttl_secs: u64,
}

impl TokenAuthenticator {
    pub fn new(secret: Vec<u8>, ttl_secs: u64) -> Self {
        Self { secret, ttl_secs }
    }

    /// Mint a token for `user_id` with the configured lifetime.
    pub fn issue(&self, user_id: UserId) -> String {
        sixin_core::issue_token(&self.secret, user_id, self.ttl_secs)
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, token: &str) -> SixinResult<UserId> {
        if token.is_empty() {
            return Err(SixinError::Authentication("missing token".into()));
        }
        let user_id = sixin_core::verify_token(&self.secret, token)?;
        if user_id == 0 {
            return Err(SixinError::Authentication("token names no user".into()));
        }
        Ok(user_id)
    }
}
