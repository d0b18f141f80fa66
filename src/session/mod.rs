mod lifecycle;
mod manager;
mod reconnect;
mod registry;

#[cfg(test)]
mod testing;

pub use manager::{SessionClient, SessionManager};

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SessionError};
use crate::transport::CloseReason;

/// Stable identifier of a session, kept across reconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, enough to tell sessions apart in logs and the UI
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Remote,
    Local,
}

/// Where a remote session connects to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub principal: String,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == 22 {
            write!(f, "{}@{}", self.principal, self.host)
        } else {
            write!(f, "{}@{}:{}", self.principal, self.host, self.port)
        }
    }
}

/// Credentials kept only so a session can be retried or reconnected.
///
/// Passwords never come from (or go to) a config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Secret {
    #[serde(skip)]
    pub password: Option<Arc<SecretString>>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Progress of an automatic reconnect sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectState {
    pub is_active: bool,
    pub attempt_number: u32,
    pub max_attempts: u32,
    /// Time left until the next attempt, refreshed by the countdown tick
    pub next_attempt_delay_ms: u64,
    pub reason: CloseReason,
}

/// Read model of one terminal session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub kind: SessionKind,
    pub label: String,
    /// Present for remote sessions
    pub endpoint: Option<Endpoint>,
    /// Working directory for local sessions
    pub cwd: Option<PathBuf>,
    pub status: SessionStatus,
    pub last_activity: DateTime<Utc>,
    pub error_message: Option<String>,
    pub reconnect: Option<ReconnectState>,
    pub latency_ms: Option<u64>,
    /// Lifetime count of output bytes discarded by the overflow policy
    pub dropped_bytes_total: u64,
}

/// Request to open a session.
///
/// Deserializes from entries like
/// `{ "kind": "remote", "host": "10.0.0.5", "port": 22, "principal": "admin" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSpec {
    pub kind: SessionKind,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u32,
    #[serde(default)]
    pub principal: String,
    #[serde(flatten)]
    pub secret: Secret,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub label: Option<String>,
}

fn default_port() -> u32 {
    22
}

impl SessionSpec {
    pub fn remote(host: impl Into<String>, port: u32, principal: impl Into<String>) -> Self {
        Self {
            kind: SessionKind::Remote,
            host: host.into(),
            port,
            principal: principal.into(),
            secret: Secret::default(),
            cwd: None,
            label: None,
        }
    }

    pub fn local(cwd: Option<PathBuf>) -> Self {
        Self {
            kind: SessionKind::Local,
            host: String::new(),
            port: 0,
            principal: String::new(),
            secret: Secret::default(),
            cwd,
            label: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.secret.password = Some(Arc::new(SecretString::from(password.into())));
        self
    }

    pub fn with_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.secret.key_path = Some(key_path.into());
        self
    }

    /// Check the endpoint fields of a remote spec
    pub fn validate(&self) -> Result<()> {
        if self.kind == SessionKind::Local {
            return Ok(());
        }
        if self.host.trim().is_empty() {
            return Err(SessionError::InvalidSpec("host must not be empty".to_string()));
        }
        if self.principal.trim().is_empty() {
            return Err(SessionError::InvalidSpec(
                "username must not be empty".to_string(),
            ));
        }
        if self.port == 0 || self.port > u16::MAX as u32 {
            return Err(SessionError::InvalidSpec(format!(
                "port {} is outside 1..=65535",
                self.port
            )));
        }
        Ok(())
    }

    /// Validated endpoint, `None` for local specs
    pub fn endpoint(&self) -> Result<Option<Endpoint>> {
        self.validate()?;
        Ok(match self.kind {
            SessionKind::Remote => Some(Endpoint {
                host: self.host.trim().to_string(),
                port: self.port as u16,
                principal: self.principal.trim().to_string(),
            }),
            SessionKind::Local => None,
        })
    }

    pub fn default_label(&self) -> String {
        match self.kind {
            SessionKind::Remote => format!("{}@{}", self.principal.trim(), self.host.trim()),
            SessionKind::Local => "local".to_string(),
        }
    }
}
