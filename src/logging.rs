use std::fs::{self, OpenOptions};
use std::path::PathBuf;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Defaults to `shelldeck.log` under the platform data dir
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("no writable location for the log file; pass --log-file")]
    NoLogDir,
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

impl LogConfig {
    pub fn resolved_file(&self) -> Result<PathBuf, InitError> {
        match &self.file {
            Some(path) => Ok(path.clone()),
            None => dirs::data_local_dir()
                .map(|dir| dir.join("shelldeck").join("shelldeck.log"))
                .ok_or(InitError::NoLogDir),
        }
    }
}

/// Install the global subscriber. The terminal belongs to the UI, so records
/// always go to a file. Keep the guard alive until exit or the tail of the
/// log is lost.
pub fn init(config: &LogConfig) -> Result<WorkerGuard, InitError> {
    let path = config.resolved_file()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| InitError::Io {
            path: path.clone(),
            source,
        })?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| InitError::Io {
            path: path.clone(),
            source,
        })?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(config.level.to_filter()))
        .with_level(true)
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(false)
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;
    Ok(guard)
}

/// `SHELLDECK_LOG` overrides the level flag entirely
fn build_env_filter(level: LevelFilter) -> EnvFilter {
    if let Ok(filter) = std::env::var("SHELLDECK_LOG") {
        return EnvFilter::new(filter);
    }
    EnvFilter::new(default_filter_for(level))
}

fn default_filter_for(level: LevelFilter) -> String {
    match level {
        LevelFilter::TRACE => "info,shelldeck=trace".to_string(),
        LevelFilter::DEBUG => "info,shelldeck=debug".to_string(),
        other => other.to_string().to_lowercase(),
    }
}
