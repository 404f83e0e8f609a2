//! Error types for configuration and serving.

use std::io;

use thiserror::Error;

/// Errors raised while validating hook or server configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The status code is not a valid HTTP status.
    #[error("invalid redirect status code: {0}")]
    InvalidStatus(u16),

    /// The redirect path contains whitespace or control characters.
    #[error("invalid redirect path: {0:?}")]
    InvalidRedirectPath(String),

    /// An extra header name is not a valid HTTP token.
    #[error("invalid header name: {0:?}")]
    InvalidHeaderName(String),

    /// An extra header value contains CR, LF or other forbidden bytes.
    #[error("invalid value for header {name}")]
    InvalidHeaderValue { name: String },

    /// The classification window must be non-zero.
    #[error("peek timeout must be greater than zero")]
    ZeroPeekTimeout,
}

/// Errors that stop the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configuration did not validate.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Certificate or key material could not be loaded.
    #[error("failed to load certificate material: {0}")]
    Certificate(#[source] io::Error),

    /// rustls rejected the certificate material or protocol settings.
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The listener failed; fatal for the whole server.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

impl ServerError {
    /// Returns true if this error came from the listening socket.
    pub fn is_listener_failure(&self) -> bool {
        matches!(self, ServerError::Bind { .. } | ServerError::Accept(_))
    }
}
