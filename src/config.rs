use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};
use crate::session::SessionSpec;

/// Streaming buffer limits and flush cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Largest fragment stored in the queue; bigger chunks are split on ingest
    pub max_chunk_size: usize,
    /// Upper bound on queued fragments per session
    pub max_chunks: usize,
    /// Upper bound on queued bytes per session
    pub max_total_bytes: usize,
    /// Largest single write handed to the rendering sink
    pub write_batch_size: usize,
    /// Render tick cadence
    pub flush_interval_ms: u64,
    /// Minimum spacing between overflow warnings
    pub overflow_warn_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 16 * 1024,
            max_chunks: 100,
            max_total_bytes: 1024 * 1024,
            write_batch_size: 8 * 1024,
            flush_interval_ms: 16,
            overflow_warn_interval_ms: 1000,
        }
    }
}

impl StreamConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn overflow_warn_interval(&self) -> Duration {
        Duration::from_millis(self.overflow_warn_interval_ms)
    }
}

/// Automatic reconnect policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    /// How often the visible countdown is refreshed
    pub countdown_tick_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            countdown_tick_ms: 1000,
        }
    }
}

/// Settings for the process-backed transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub ssh_program: String,
    pub shell: String,
    /// Unacknowledged bytes a session may have in flight before its reader pauses
    pub flow_window_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            shell: std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
            flow_window_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stream: StreamConfig,
    pub reconnect: ReconnectConfig,
    pub connect_timeout_ms: u64,
    pub transport: TransportConfig,
    /// Sessions opened at startup
    pub sessions: Vec<SessionSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            reconnect: ReconnectConfig::default(),
            connect_timeout_ms: 30_000,
            transport: TransportConfig::default(),
            sessions: Vec::new(),
        }
    }
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Default location: `<config dir>/shelldeck/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("shelldeck").join("config.json"))
    }

    /// Load from an explicit path, else the default path if it exists, else defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path().filter(|p| p.exists()),
        };

        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|e| {
                    SessionError::Config(format!("failed to read {}: {}", path.display(), e))
                })?;
                Self::from_json(&raw)?
            }
            None => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| SessionError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.stream;
        if s.max_chunk_size == 0
            || s.max_chunks == 0
            || s.max_total_bytes == 0
            || s.write_batch_size == 0
        {
            return Err(SessionError::Config(
                "stream sizes must be greater than zero".to_string(),
            ));
        }
        if s.flush_interval_ms == 0 {
            return Err(SessionError::Config(
                "stream.flush_interval_ms must be greater than zero".to_string(),
            ));
        }
        if s.write_batch_size > s.max_total_bytes {
            return Err(SessionError::Config(
                "stream.write_batch_size cannot exceed stream.max_total_bytes".to_string(),
            ));
        }

        let r = &self.reconnect;
        if r.max_attempts == 0 {
            return Err(SessionError::Config(
                "reconnect.max_attempts must be at least 1".to_string(),
            ));
        }
        if r.backoff_multiplier < 1.0 {
            return Err(SessionError::Config(
                "reconnect.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if r.countdown_tick_ms == 0 {
            return Err(SessionError::Config(
                "reconnect.countdown_tick_ms must be greater than zero".to_string(),
            ));
        }

        for spec in &self.sessions {
            spec.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_pipeline_limits() {
        let config = Config::default();
        assert_eq!(config.stream.max_chunk_size, 16384);
        assert_eq!(config.stream.max_chunks, 100);
        assert_eq!(config.stream.max_total_bytes, 1_048_576);
        assert_eq!(config.stream.write_batch_size, 8192);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = Config::from_json(r#"{ "reconnect": { "max_attempts": 3 } }"#).unwrap();
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.initial_delay_ms, 1000);
        assert_eq!(config.stream, StreamConfig::default());
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let config = Config::from_json(r#"{ "reconnect": { "max_attempts": 0 } }"#).unwrap();
        assert!(matches!(config.validate(), Err(SessionError::Config(_))));
    }

    #[test]
    fn test_rejects_batch_larger_than_buffer() {
        let raw = r#"{ "stream": { "write_batch_size": 4096, "max_total_bytes": 1024 } }"#;
        let config = Config::from_json(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file_with_sessions() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "sessions": [ {{ "kind": "remote", "host": "10.0.0.5", "port": 22, "principal": "admin" }} ] }}"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.sessions.len(), 1);
    }

    #[test]
    fn test_load_rejects_invalid_session() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "sessions": [ {{ "kind": "remote", "host": "", "port": 22, "principal": "admin" }} ] }}"#
        )
        .unwrap();

        assert!(matches!(
            Config::load(Some(file.path())),
            Err(SessionError::InvalidSpec(_))
        ));
    }
}
