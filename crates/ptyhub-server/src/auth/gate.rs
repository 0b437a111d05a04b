//! Shared-secret authentication.
//!
//! The secret is never compared directly: at startup it is signed with a
//! random HMAC key, and presented tokens are checked with `hmac::verify`,
//! which runs in constant time.

use ptyhub_core::{HubError, HubResult};
use ring::hmac;
use ring::rand::SystemRandom;
use tracing::debug;

struct Secret {
    key: hmac::Key,
    tag: hmac::Tag,
}

/// Checks bearer tokens against a configured secret.
pub struct AuthGate {
    secret: Option<Secret>,
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl AuthGate {
    /// Build a gate for `secret`. `None` or an empty secret disables auth.
    pub fn new(secret: Option<&str>) -> HubResult<Self> {
        let secret = match secret.filter(|s| !s.is_empty()) {
            Some(secret) => {
                let rng = SystemRandom::new();
                let key = hmac::Key::generate(hmac::HMAC_SHA256, &rng)
                    .map_err(|_| HubError::Internal("failed to generate HMAC key".into()))?;
                let tag = hmac::sign(&key, secret.as_bytes());
                Some(Secret { key, tag })
            }
            None => None,
        };
        Ok(Self { secret })
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// Check a presented token.
    pub fn check(&self, presented: &str) -> HubResult<()> {
        let Some(secret) = &self.secret else {
            return Ok(());
        };
        hmac::verify(&secret.key, presented.as_bytes(), secret.tag.as_ref()).map_err(|_| {
            debug!("token mismatch");
            HubError::AuthFailed("invalid token".into())
        })
    }

    /// Check the value of an `Authorization` header (`Bearer <token>`).
    pub fn check_authorization_header(&self, header: Option<&str>) -> HubResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let header = header.ok_or_else(|| HubError::AuthFailed("missing credentials".into()))?;
        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .ok_or_else(|| HubError::AuthFailed("expected a bearer token".into()))?;
        self.check(token.trim())
    }
}
