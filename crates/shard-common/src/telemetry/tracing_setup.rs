//! Tracing and logging setup
//!
//! One subscriber per process: an `EnvFilter` (from `RUST_LOG`, or the configured level
//! plus quieter defaults for the WebSocket and HTTP stacks) and a fmt layer writing
//! plain or JSON lines to stdout or stderr.

use crate::config::Environment;
use tracing::Level;
use tracing_subscriber::{
    filter::Directive,
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Filter directives applied when `RUST_LOG` is unset
const DEPENDENCY_DIRECTIVES: &[&str] = &[
    "tungstenite=warn",
    "tokio_tungstenite=warn",
    "hyper=warn",
    "reqwest=warn",
];

/// Where formatted log lines go
///
/// Worker processes must log to stderr because stdout carries the IPC channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogWriter {
    #[default]
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Level used when `RUST_LOG` is unset
    pub level: Level,
    pub json: bool,
    /// Log span open/close
    pub span_events: bool,
    pub file_line: bool,
    pub thread_names: bool,
    pub writer: LogWriter,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json: false,
            span_events: false,
            file_line: true,
            thread_names: false,
            writer: LogWriter::Stdout,
        }
    }
}

impl TracingConfig {
    /// Debug level with span events and thread names
    #[must_use]
    pub fn development() -> Self {
        Self {
            level: Level::DEBUG,
            span_events: true,
            thread_names: true,
            ..Self::default()
        }
    }

    /// JSON lines at info level, no source locations
    #[must_use]
    pub fn production() -> Self {
        Self {
            json: true,
            file_line: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn for_environment(env: Environment) -> Self {
        match env {
            Environment::Development => Self::development(),
            Environment::Staging => Self::default(),
            Environment::Production => Self::production(),
        }
    }

    /// Same configuration, writing to stderr (for worker processes)
    #[must_use]
    pub fn to_stderr(mut self) -> Self {
        self.writer = LogWriter::Stderr;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            DEPENDENCY_DIRECTIVES
                .iter()
                .filter_map(|directive| directive.parse::<Directive>().ok())
                .fold(EnvFilter::new(self.level.to_string()), |filter, directive| {
                    filter.add_directive(directive)
                })
        })
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let writer = match self.writer {
            LogWriter::Stdout => BoxMakeWriter::new(std::io::stdout),
            LogWriter::Stderr => BoxMakeWriter::new(std::io::stderr),
        };
        let spans = if self.span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(self.writer == LogWriter::Stdout && !self.json)
            .with_file(self.file_line)
            .with_line_number(self.file_line)
            .with_thread_names(self.thread_names)
            .with_span_events(spans);

        if self.json {
            layer.json().boxed()
        } else {
            layer.boxed()
        }
    }
}

/// Install the default subscriber
///
/// # Panics
/// If a global subscriber is already set.
pub fn init_tracing() {
    init_tracing_with_config(TracingConfig::default());
}

/// # Panics
/// If a global subscriber is already set.
pub fn init_tracing_with_config(config: TracingConfig) {
    tracing_subscriber::registry()
        .with(config.layer())
        .with(config.filter())
        .init();
}

pub fn try_init_tracing() -> Result<(), TracingError> {
    try_init_tracing_with_config(TracingConfig::default())
}

/// Install a subscriber, failing instead of panicking when one is already set
pub fn try_init_tracing_with_config(config: TracingConfig) -> Result<(), TracingError> {
    tracing_subscriber::registry()
        .with(config.layer())
        .with(config.filter())
        .try_init()
        .map_err(|_| TracingError::AlreadyInitialized)
}

#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("Tracing subscriber already initialized")]
    AlreadyInitialized,
}
