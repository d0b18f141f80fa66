use thiserror::Error;

use crate::session::{SessionId, SessionStatus};

/// Errors surfaced by the session core
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Rejected `open()` arguments; nothing was mutated
    #[error("invalid session spec: {0}")]
    InvalidSpec(String),

    /// The transport did not resolve within the connect deadline
    #[error("connection timed out after {0}s")]
    ConnectTimeout(u64),

    /// The transport rejected the connection
    #[error("connection failed: {0}")]
    ConnectFailure(String),

    /// The transport closed after having been connected
    #[error("connection closed unexpectedly ({0})")]
    UnexpectedClose(String),

    /// Every scheduled reconnect attempt failed
    #[error("reconnect failed after {0} attempts")]
    ReconnectExhausted(u32),

    /// Oldest output was discarded to stay within buffer limits
    #[error("output buffer overflow: dropped {0} bytes")]
    BufferOverflow(usize),

    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("illegal transition from {from:?} on {event}")]
    IllegalTransition {
        from: SessionStatus,
        event: &'static str,
    },

    /// The session manager task is no longer running
    #[error("session manager is not running")]
    ManagerClosed,

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
