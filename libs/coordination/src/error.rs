//! Error types for coordination operations.
//!
//! Provides typed error variants so that consumers (registrar, watcher,
//! supervisor) can tell transport failures, missing keys, and expired sessions
//! apart without leaking backend internals.

use thiserror::Error;

/// Top-level error type for the coordination crate.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Connection or transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation timed out waiting for the coordination service.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Codec error during payload serialization or deserialization.
    #[error("codec error: {0}")]
    Codec(String),

    /// Configuration error (e.g. malformed url or registry root).
    #[error("configuration error: {0}")]
    Config(String),

    /// The client has no live session, or the session is suspended.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// The key does not exist.
    #[error("no node: {0}")]
    NoNode(String),

    /// The key already exists.
    #[error("node exists: {0}")]
    NodeExists(String),

    /// The session that issued the operation has expired or was closed.
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// The client was cancelled while the operation was in progress.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A protocol-level error reported by the coordination service.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl CoordinationError {
    /// Returns true if this error indicates a transient failure that may
    /// succeed on retry (transport, timeout, or a suspended session).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::Transport(_)
                | CoordinationError::Timeout(_)
                | CoordinationError::NotConnected(_)
        )
    }

    /// Returns true if the key the operation referred to does not exist.
    pub fn is_no_node(&self) -> bool {
        matches!(self, CoordinationError::NoNode(_))
    }

    /// Returns true if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoordinationError::Timeout(_))
    }
}

/// Shorthand result alias for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let transport = CoordinationError::Transport("conn reset".into());
        assert!(transport.is_retryable());
        assert!(!transport.is_no_node());
        assert!(!transport.is_timeout());

        let timeout = CoordinationError::Timeout("deadline exceeded".into());
        assert!(timeout.is_retryable());
        assert!(timeout.is_timeout());

        let suspended = CoordinationError::NotConnected("suspended".into());
        assert!(suspended.is_retryable());

        let no_node = CoordinationError::NoNode("/macondo/nodes/0000000001".into());
        assert!(!no_node.is_retryable());
        assert!(no_node.is_no_node());

        let exists = CoordinationError::NodeExists("/macondo".into());
        assert!(!exists.is_retryable());

        let expired = CoordinationError::SessionExpired("session 3".into());
        assert!(!expired.is_retryable());

        let cancelled = CoordinationError::Cancelled("shutdown".into());
        assert!(!cancelled.is_retryable());

        let codec = CoordinationError::Codec("bad json".into());
        assert!(!codec.is_retryable());

        let config = CoordinationError::Config("missing url".into());
        assert!(!config.is_retryable());

        let proto = CoordinationError::Protocol("unknown version".into());
        assert!(!proto.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = CoordinationError::NoNode("/macondo/nodes/0000000007".into());
        assert_eq!(format!("{err}"), "no node: /macondo/nodes/0000000007");
    }
}
