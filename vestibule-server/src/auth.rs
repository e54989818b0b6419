//! Pluggable connection authentication.
//!
//! An [`Authenticator`] is resolved once per incoming connection through an
//! [`AuthenticatorProvider`], so the decision may vary by peer address. A
//! provider that returns `None` admits the connection without any
//! authentication step.
//!
//! The shipped [`TokenAuthenticator`] validates bearer tokens against
//! SHA-256 hashes, so configuration never holds plaintext tokens.

use crate::error::ServerError;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

/// Verifies the credential presented by one incoming connection.
pub trait Authenticator: Send + Sync {
    /// Checks the presented credential, returning an error on rejection.
    fn verify(&self, credential: &str) -> Result<(), ServerError>;
}

/// Resolves the authenticator, if any, for one incoming connection.
///
/// Invoked once per accepted connection.
pub type AuthenticatorProvider =
    Arc<dyn Fn(SocketAddr) -> Option<Arc<dyn Authenticator>> + Send + Sync>;

/// Provider that disables authentication for every connection.
pub fn no_authentication() -> AuthenticatorProvider {
    Arc::new(|_| None)
}

/// Validates bearer tokens against pre-configured SHA-256 hashes.
#[derive(Debug, Clone)]
pub struct TokenAuthenticator {
    /// Set of valid token hashes (SHA-256 hex strings).
    valid_hashes: HashSet<String>,
}

impl TokenAuthenticator {
    /// Creates a new authenticator with the given token hashes.
    pub fn new(hashes: impl IntoIterator<Item = String>) -> Self {
        Self {
            valid_hashes: hashes.into_iter().collect(),
        }
    }

    /// Returns whether any tokens are configured.
    pub fn has_tokens(&self) -> bool {
        !self.valid_hashes.is_empty()
    }

    /// Returns the number of configured tokens.
    pub fn token_count(&self) -> usize {
        self.valid_hashes.len()
    }

    /// Hashes a token using SHA-256, returning a lowercase hex string.
    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl Authenticator for TokenAuthenticator {
    fn verify(&self, credential: &str) -> Result<(), ServerError> {
        // An empty hash set rejects everything rather than admitting everyone.
        if self.valid_hashes.contains(&Self::hash_token(credential)) {
            Ok(())
        } else {
            Err(ServerError::AuthFailed("unrecognized token".into()))
        }
    }
}
