//! Log subscriber setup for binaries embedding a mesh service.
//!
//! The runtime itself only emits `tracing` events inside the span handed to
//! [`MeshService::with_span`](crate::MeshService::with_span); it never
//! installs a subscriber. Binaries call [`LogConfig::init`] once at startup.
//!
//! ```no_run
//! use toska_runtime::logging::{LogConfig, LogFormat, LogLevel};
//!
//! LogConfig::new()
//!     .level(LogLevel::Debug)
//!     .format(LogFormat::Pretty)
//!     .init()
//!     .expect("logging already initialised");
//! ```
//!
//! `RUST_LOG`, when set, takes precedence over the configured level and filter.

use crate::Error;
use std::io;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::fmt::{self, MakeWriter, format::FmtSpan};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Log level for filtering messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(Error::InvalidConfiguration(format!("unknown log level: {other}"))),
        }
    }
}

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    Plain,
    /// Multi-line, for local development
    Pretty,
    Compact,
}

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,
    pub thread_ids: bool,
    /// Include target (module path)
    pub targets: bool,
    pub file_line: bool,
    /// Attach the current span and its parents to every event, and log span closes
    pub spans: bool,
    /// Enable ANSI colors (ignored for JSON)
    pub colors: bool,
    /// Filter directives such as `toska_runtime=debug,hyper=info`; replaces `level`
    pub env_filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            thread_ids: false,
            targets: true,
            file_line: false,
            spans: true,
            colors: true,
            env_filter: None,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_thread_ids(mut self, enable: bool) -> Self {
        self.thread_ids = enable;
        self
    }

    pub fn with_targets(mut self, enable: bool) -> Self {
        self.targets = enable;
        self
    }

    pub fn with_file_line(mut self, enable: bool) -> Self {
        self.file_line = enable;
        self
    }

    pub fn with_spans(mut self, enable: bool) -> Self {
        self.spans = enable;
        self
    }

    pub fn with_colors(mut self, enable: bool) -> Self {
        self.colors = enable;
        self
    }

    pub fn with_env_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Directives used when `RUST_LOG` is unset.
    pub fn directives(&self) -> String {
        self.env_filter
            .clone()
            .filter(|f| EnvFilter::try_new(f).is_ok())
            .unwrap_or_else(|| self.level.as_str().to_string())
    }

    /// Install the global subscriber.
    ///
    /// Fails if a global subscriber is already set.
    pub fn init(self) -> Result<(), TryInitError> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.directives()));

        match self.output {
            LogOutput::Stdout => self.init_with_writer(io::stdout, filter),
            LogOutput::Stderr => self.init_with_writer(io::stderr, filter),
        }
    }

    fn init_with_writer<W>(&self, writer: W, filter: EnvFilter) -> Result<(), TryInitError>
    where
        W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
    {
        let span_events = if self.spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let layer: Box<dyn Layer<Registry> + Send + Sync> = match self.format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_writer(writer)
                .with_current_span(self.spans)
                .with_span_list(self.spans)
                .with_target(self.targets)
                .with_thread_ids(self.thread_ids)
                .with_file(self.file_line)
                .with_line_number(self.file_line)
                .with_span_events(span_events)
                .boxed(),
            LogFormat::Plain => fmt::layer()
                .with_writer(writer)
                .with_target(self.targets)
                .with_thread_ids(self.thread_ids)
                .with_file(self.file_line)
                .with_line_number(self.file_line)
                .with_ansi(self.colors)
                .with_span_events(span_events)
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .pretty()
                .with_writer(writer)
                .with_target(self.targets)
                .with_thread_ids(self.thread_ids)
                .with_file(self.file_line)
                .with_line_number(self.file_line)
                .with_ansi(self.colors)
                .with_span_events(span_events)
                .boxed(),
            LogFormat::Compact => fmt::layer()
                .compact()
                .with_writer(writer)
                .with_target(self.targets)
                .with_thread_ids(self.thread_ids)
                .with_ansi(self.colors)
                .with_span_events(span_events)
                .boxed(),
        };

        tracing_subscriber::registry()
            .with(layer)
            .with(filter)
            .try_init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.output, LogOutput::Stdout);
        assert!(config.spans);
        assert_eq!(config.directives(), "info");
    }

    #[test]
    fn test_builder() {
        let config = LogConfig::new()
            .level(LogLevel::Debug)
            .format(LogFormat::Compact)
            .output(LogOutput::Stderr)
            .with_thread_ids(true)
            .with_spans(false);

        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::Compact);
        assert_eq!(config.output, LogOutput::Stderr);
        assert!(config.thread_ids);
        assert!(!config.spans);
        assert_eq!(config.directives(), "debug");
    }

    #[test]
    fn test_env_filter_replaces_level() {
        let config = LogConfig::new()
            .level(LogLevel::Warn)
            .with_env_filter("toska_runtime=debug,hyper=info");
        assert_eq!(config.directives(), "toska_runtime=debug,hyper=info");
    }

    #[test]
    fn test_invalid_env_filter_falls_back_to_level() {
        let config = LogConfig::new()
            .level(LogLevel::Error)
            .with_env_filter("toska_runtime=loudest");
        assert_eq!(config.directives(), "error");
    }

    #[test]
    fn test_level_from_str() {
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Trace.to_tracing_level(), Level::TRACE);
    }
}
