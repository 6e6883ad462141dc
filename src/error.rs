//! Error types for Lumen
//!
//! This module defines the main error type used throughout Lumen. The
//! taxonomy follows the failure-handling policy of the engine: invalid
//! input is rejected at the boundary, resource exhaustion fails only the
//! affected call, transient connection errors close the connection, and
//! stale-view messages are dropped by the caller. Protocol violations that
//! indicate view-membership desynchronization are not representable here;
//! they terminate the node via panic.

use thiserror::Error;

/// Result type alias for Lumen operations
pub type Result<T> = std::result::Result<T, LumenError>;

/// Main error type for Lumen operations
#[derive(Debug, Error)]
pub enum LumenError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),

    #[error("Invalid func_id: {0}")]
    InvalidFuncId(u16),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Message from past view {msg_view} (current {current_view})")]
    StaleView { msg_view: u16, current_view: u16 },

    #[error("Function call timed out after {0} ms")]
    FuncCallTimeout(u64),

    #[error("Shared memory error: {0}")]
    ShmError(String),

    #[error("FIFO error: {0}")]
    FifoError(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),
}

impl LumenError {
    /// Whether the connection that produced this error should be closed.
    ///
    /// Boundary errors (bad handshake, protocol framing) and transient IO
    /// errors are unrecoverable for the connection; per-call failures are
    /// not.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            LumenError::Io(_)
                | LumenError::InvalidHandshake(_)
                | LumenError::Protocol(_)
                | LumenError::ConnectionClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_error_closes_connection() {
        let err = LumenError::InvalidHandshake("not a handshake".into());
        assert!(err.closes_connection());
    }

    #[test]
    fn test_call_errors_keep_connection() {
        assert!(!LumenError::InvalidFuncId(7).closes_connection());
        assert!(!LumenError::ResourceExhausted("shm".into()).closes_connection());
        assert!(!LumenError::FuncCallTimeout(100).closes_connection());
    }

    #[test]
    fn test_error_display() {
        let err = LumenError::StaleView {
            msg_view: 3,
            current_view: 5,
        };
        assert_eq!(err.to_string(), "Message from past view 3 (current 5)");
    }
}
