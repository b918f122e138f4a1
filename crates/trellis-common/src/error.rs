//! Common error types for Trellis.
//!
//! Each variant is scoped to what it aborts: a `Crypto` or `Protocol` error
//! drops one message, a `Transport` error ends one session, a `Routing`
//! error drops one send. None of them stop the node.

use thiserror::Error;

/// Result type alias using Trellis's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Trellis operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad key material, tag failure or signature mismatch
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Socket reset, accept or connect failure
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Malformed envelope, unknown type, exhausted TTL, stale timestamp
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No session or membership entry for the destination
    #[error("routing error: {0}")]
    Routing(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Remote identity refused by the authorizer
    #[error("authorization error: {0}")]
    Auth(String),

    /// Operation timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a crypto error from any displayable type.
    pub fn crypto(msg: impl std::fmt::Display) -> Self {
        Self::Crypto(msg.to_string())
    }

    /// Create a protocol error from any displayable type.
    pub fn protocol(msg: impl std::fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Create a routing error from any displayable type.
    pub fn routing(msg: impl std::fmt::Display) -> Self {
        Self::Routing(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create an auth error from any displayable type.
    pub fn auth(msg: impl std::fmt::Display) -> Self {
        Self::Auth(msg.to_string())
    }

    /// Create a timeout error from any displayable type.
    pub fn timeout(msg: impl std::fmt::Display) -> Self {
        Self::Timeout(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    /// Whether the error ends the session it occurred on.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_keep_message() {
        assert_eq!(
            Error::routing("no route to bob").to_string(),
            "routing error: no route to bob"
        );
        assert_eq!(
            Error::protocol("ttl exhausted").to_string(),
            "protocol error: ttl exhausted"
        );
    }

    #[test]
    fn only_transport_and_timeout_end_a_session() {
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(Error::from(io).is_session_fatal());
        assert!(Error::timeout("write").is_session_fatal());
        assert!(!Error::crypto("auth tag mismatch").is_session_fatal());
        assert!(!Error::routing("no route").is_session_fatal());
    }
}
