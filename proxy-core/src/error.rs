//! Error types for proxy operations

use thiserror::Error;

/// Main error type for proxy operations.
///
/// Only [`ProxyError::AuthorityUnavailable`] is fatal to the process. Everything else is scoped
/// to the connection or request that produced it.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The persisted signing root is missing a half, unreadable or corrupt
    #[error("Certificate authority unavailable: {0}")]
    AuthorityUnavailable(String),
    /// Leaf certificate issuance failed for one hostname
    #[error("Certificate issuance failed for {host}: {reason}")]
    Issuance { host: String, reason: String },
    /// The archive gateway could not answer
    #[error("Gateway unavailable: {0}")]
    GatewayUnavailable(String),
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(String),
    /// General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn issuance(host: &str, reason: impl std::fmt::Display) -> Self {
        ProxyError::Issuance {
            host: host.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Failures reported by a [`crate::gateway::Gateway`] backend.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Backend unreachable, timed out or answering with server errors
    #[error("archive backend unavailable: {0}")]
    Unavailable(String),
    /// Backend answered with something we could not understand
    #[error("unexpected archive response: {0}")]
    Protocol(String),
}

impl From<GatewayError> for ProxyError {
    fn from(err: GatewayError) -> Self {
        ProxyError::GatewayUnavailable(err.to_string())
    }
}
