mod process;

pub use process::ProcessTransport;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::session::{Endpoint, Secret, SessionId};

/// Why a transport channel closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseReason {
    /// Closed on request or the shell exited normally
    User,
    /// Credentials were rejected
    Auth,
    Network,
    Timeout,
    Unknown,
}

impl CloseReason {
    /// Whether this reason may be retried automatically
    pub fn is_recoverable(self) -> bool {
        !matches!(self, CloseReason::User | CloseReason::Auth)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::User => "user",
            CloseReason::Auth => "auth",
            CloseReason::Network => "network",
            CloseReason::Timeout => "timeout",
            CloseReason::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Events a transport reports for its sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Output bytes from the remote side
    Data { id: SessionId, bytes: Vec<u8> },
    /// The channel closed
    Closed {
        id: SessionId,
        reason: CloseReason,
        exit_code: Option<i32>,
    },
    /// Round-trip measurement in milliseconds
    Latency { id: SessionId, ms: u64 },
}

/// Opaque duplex byte channel keyed by session id.
///
/// Only the open calls are async. The rest hand work off and return
/// immediately; outcomes arrive as [`TransportEvent`]s.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_remote(&self, id: SessionId, endpoint: &Endpoint, secret: &Secret)
        -> Result<()>;

    async fn open_local(&self, id: SessionId, cwd: Option<&Path>) -> Result<()>;

    fn close(&self, id: SessionId);

    /// Forward keystrokes verbatim
    fn write_input(&self, id: SessionId, data: Vec<u8>);

    fn resize(&self, id: SessionId, cols: u16, rows: u16);

    /// Flow-control acknowledgment: `bytes` were delivered to the rendering sink
    fn notify_consumed(&self, id: SessionId, bytes: usize);

    /// Close the channel and drop anything still kept for a removed session
    fn forget(&self, id: SessionId);
}
