//! Credential verification seam.
//!
//! Credential issuance lives with an external identity service; the broker
//! only needs a yes/no plus the caller identity.

use async_trait::async_trait;
use thiserror::Error;

/// Authentication error. Non-retryable without new credentials.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing credential")]
    Missing,
    #[error("Invalid credential")]
    Invalid,
}

/// Verifies an opaque credential and resolves the caller identity.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Verify a credential.
    ///
    /// # Errors
    /// Returns `Missing` if no credential was presented, `Invalid` if
    /// verification fails.
    async fn verify(&self, credential: Option<&str>) -> Result<String, AuthError>;
}

/// Verifier accepting a single shared token.
///
/// Useful for tests and single-tenant deployments.
pub struct StaticTokenVerifier {
    token: String,
    identity: String,
}

impl StaticTokenVerifier {
    /// Accept `token`, resolving every caller to `identity`.
    #[must_use]
    pub fn new(token: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            identity: identity.into(),
        }
    }
}

#[async_trait]
impl IdentityVerifier for StaticTokenVerifier {
    async fn verify(&self, credential: Option<&str>) -> Result<String, AuthError> {
        match credential {
            None => Err(AuthError::Missing),
            Some(token) if token == self.token => Ok(self.identity.clone()),
            Some(_) => Err(AuthError::Invalid),
        }
    }
}
