//! Server error types.

use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("connection limit reached")]
    ConnectionLimit,

    #[error("server shutting down")]
    ShuttingDown,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl ServerError {
    /// Returns whether this error originates from the peer rather than the
    /// server. Peer faults on a pending connection are downgraded to a warn
    /// event instead of a server error.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            ServerError::Io(_) | ServerError::AuthFailed(_) | ServerError::TlsHandshake(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_fault_classification() {
        assert!(ServerError::AuthFailed("bad token".into()).is_peer_fault());
        assert!(ServerError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
            .is_peer_fault());
        assert!(!ServerError::ShuttingDown.is_peer_fault());
        assert!(!ServerError::TlsConfig("missing key".into()).is_peer_fault());
    }
}
