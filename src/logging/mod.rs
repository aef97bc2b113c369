//! Logging configuration and initialization
//!
//! Centralized `tracing` setup for binaries and tests. Supports human-readable
//! and JSON output, with an optional JSON log file alongside the console.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter (e.g., "info", "debug,batchforge=trace")
//! - `BATCHFORGE_LOG_LEVEL`: Simple log level (error, warn, info, debug, trace)
//! - `BATCHFORGE_LOG_FORMAT`: Output format ("human" or "json")
//! - `BATCHFORGE_LOG_FILE`: Optional file path for log output (always JSON)

use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Set once the global subscriber has been installed (or attempted)
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const LOG_LEVEL_ENV: &str = "BATCHFORGE_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "BATCHFORGE_LOG_FORMAT";
const LOG_FILE_ENV: &str = "BATCHFORGE_LOG_FILE";

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Unrecognized level name
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    /// Unrecognized format name
    #[error("invalid log format: {0}")]
    InvalidLogFormat(String),

    /// The log file's parent directory could not be created
    #[error("failed to create log directory: {0}")]
    DirectoryCreationFailed(String),

    /// The log file could not be opened for appending
    #[error("failed to open log file: {0}")]
    FileOpenFailed(String),

    /// Another global subscriber was installed first
    #[error("failed to install subscriber: {0}")]
    SubscriberInit(String),
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Errors only
    Error,
    /// Warnings and errors
    Warn,
    /// Lifecycle events (default)
    #[default]
    Info,
    /// Per-request and per-batch detail
    Debug,
    /// Everything
    Trace,
}

impl LogLevel {
    /// Convert to the equivalent `tracing` level
    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }

    /// Parse from string (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Directive string for `EnvFilter`
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable console output (default)
    #[default]
    Human,
    /// One JSON object per line
    Json,
}

impl LogFormat {
    /// Parse from string (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "human" | "pretty" | "console" => Some(LogFormat::Human),
            "json" | "structured" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// Level used when `RUST_LOG` is unset
    pub level: LogLevel,
    /// Console format
    pub format: LogFormat,
    /// Include file/line in console output
    pub with_file_info: bool,
    /// Emit span close events (useful for timing dispatches)
    pub with_span_events: bool,
    /// Optional JSON log file, appended to
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default level
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Set the console format
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Include file and line in console output
    pub fn with_file_info(mut self, with_file_info: bool) -> Self {
        self.with_file_info = with_file_info;
        self
    }

    /// Emit span close events
    pub fn with_span_events(mut self, with_span_events: bool) -> Self {
        self.with_span_events = with_span_events;
        self
    }

    /// Also write JSON logs to `path`
    pub fn with_log_file(mut self, path: PathBuf) -> Self {
        self.log_file = Some(path);
        self
    }

    /// Build a configuration from `BATCHFORGE_LOG_*` variables.
    ///
    /// Unset variables fall back to defaults; set but unparseable values are
    /// reported as errors.
    pub fn from_env() -> Result<Self, LoggingError> {
        let mut config = LoggingConfig::new();

        if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
            config.level =
                LogLevel::parse(&level).ok_or(LoggingError::InvalidLogLevel(level))?;
        }

        if let Ok(format) = std::env::var(LOG_FORMAT_ENV) {
            config.format =
                LogFormat::parse(&format).ok_or(LoggingError::InvalidLogFormat(format))?;
        }

        if let Ok(file) = std::env::var(LOG_FILE_ENV) {
            config.log_file = Some(PathBuf::from(file));
        }

        Ok(config)
    }
}

/// Initialize logging from the environment, ignoring failures.
///
/// Idempotent: only the first call installs a subscriber.
pub fn init_logging_default() {
    if let Err(e) = init_logging_from_env() {
        eprintln!("batchforge: logging disabled: {}", e);
    }
}

/// Initialize logging from `RUST_LOG` and `BATCHFORGE_LOG_*`.
///
/// Idempotent.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    let config = LoggingConfig::from_env()?;
    init_with_config(&config)
}

/// Initialize logging with an explicit configuration.
///
/// Idempotent: after the first call (successful or not) later calls are
/// no-ops returning `Ok(())`.
pub fn init_with_config(config: &LoggingConfig) -> Result<(), LoggingError> {
    let mut result = Ok(());
    TRACING_INITIALIZED.get_or_init(|| {
        result = install(config);
    });
    result
}

fn install(config: &LoggingConfig) -> Result<(), LoggingError> {
    let env_filter = build_env_filter(config.level)?;

    // The file sink is always JSON so it can be shipped to log aggregation
    let file_layer = match &config.log_file {
        Some(path) => Some(
            fmt::layer()
                .json()
                .with_writer(Mutex::new(open_log_file(path)?))
                .with_target(false)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_span_events(span_events(config.with_span_events)),
        ),
        None => None,
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer);

    let installed = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_file(config.with_file_info)
                    .with_line_number(config.with_file_info)
                    .with_span_events(span_events(config.with_span_events)),
            )
            .try_init(),
        LogFormat::Human => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_names(false)
                    .with_file(config.with_file_info)
                    .with_line_number(config.with_file_info)
                    .with_span_events(span_events(config.with_span_events)),
            )
            .try_init(),
    };

    installed.map_err(|e| LoggingError::SubscriberInit(e.to_string()))
}

fn span_events(enabled: bool) -> FmtSpan {
    if enabled {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

fn open_log_file(path: &Path) -> Result<std::fs::File, LoggingError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| LoggingError::DirectoryCreationFailed(e.to_string()))?;
    }

    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| LoggingError::FileOpenFailed(e.to_string()))
}

/// Build the filter. `RUST_LOG` wins over the configured level.
fn build_env_filter(default_level: LogLevel) -> Result<EnvFilter, LoggingError> {
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(rust_log)
            .map_err(|e| LoggingError::InvalidLogLevel(e.to_string()));
    }

    Ok(EnvFilter::new(default_level.as_filter_str()))
}

/// Check if tracing has been initialized
pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_init_logging_default_idempotent() {
        init_logging_default();
        init_logging_default();
        assert!(is_initialized());
        assert!(init_with_config(&LoggingConfig::new()).is_ok());
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("error"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse(" info "), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("trace"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::parse("verbose"), None);
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("human"), Some(LogFormat::Human));
        assert_eq!(LogFormat::parse("pretty"), Some(LogFormat::Human));
        assert_eq!(LogFormat::parse("json"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    fn test_logging_config_builder() {
        let config = LoggingConfig::new()
            .with_level(LogLevel::Debug)
            .with_format(LogFormat::Json)
            .with_file_info(true)
            .with_span_events(true)
            .with_log_file(PathBuf::from("/tmp/batchforge.log"));

        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.with_file_info);
        assert!(config.with_span_events);
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/batchforge.log")));
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        std::env::set_var(LOG_LEVEL_ENV, "debug");
        std::env::set_var(LOG_FORMAT_ENV, "json");
        std::env::remove_var(LOG_FILE_ENV);

        let config = LoggingConfig::from_env().unwrap();
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.log_file.is_none());

        std::env::set_var(LOG_FORMAT_ENV, "xml");
        assert!(matches!(
            LoggingConfig::from_env(),
            Err(LoggingError::InvalidLogFormat(_))
        ));

        std::env::remove_var(LOG_LEVEL_ENV);
        std::env::remove_var(LOG_FORMAT_ENV);
    }

    #[test]
    fn test_open_log_file_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("scheduler.log");
        assert!(open_log_file(&path).is_ok());
        assert!(path.exists());
    }

    #[test]
    fn test_log_level_as_tracing_level() {
        assert_eq!(LogLevel::Error.as_tracing_level(), tracing::Level::ERROR);
        assert_eq!(LogLevel::Trace.as_tracing_level(), tracing::Level::TRACE);
    }
}
