//! Structured logging setup.
//!
//! Thin wrapper over `tracing-subscriber`: level and format presets, an
//! `RUST_LOG` override, and a non-panicking variant for tests. The
//! pipeline itself only emits `tracing` events; embedding applications
//! that install their own subscriber can skip this module entirely.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Per-permit and per-wait detail.
    Trace,
    /// Per-request detail: retries, proxy choice, token refreshes.
    Debug,
    /// State changes: breaker transitions, set replacements.
    Info,
    /// Suspicious but non-fatal conditions.
    Warn,
    /// Failures only.
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line human-readable output.
    Pretty,
    /// Single-line output.
    Compact,
    /// JSON lines for log shippers.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum level emitted, unless `RUST_LOG` overrides it.
    pub level: LogLevel,
    /// Output format.
    pub format: LogFormat,
    /// Include thread IDs in each event.
    pub show_thread_ids: bool,
    /// Include the emitting module path.
    pub show_target: bool,
    /// Emit span enter/close events.
    pub show_span_events: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            show_thread_ids: false,
            show_target: true,
            show_span_events: false,
        }
    }
}

impl LogConfig {
    /// Verbose preset for local development.
    pub fn development() -> Self {
        Self {
            level: LogLevel::Debug,
            format: LogFormat::Pretty,
            show_span_events: true,
            ..Self::default()
        }
    }

    /// JSON preset for production log shipping.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            show_thread_ids: true,
            ..Self::default()
        }
    }
}

fn env_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{}={}", crate::NAME, config.level)))
}

/// Initializes the global subscriber.
///
/// Panics if a subscriber is already installed; use
/// [`try_init_logging`] where that can happen.
pub fn init_logging(config: &LogConfig) {
    install(config, false);
}

/// Initializes the global subscriber, ignoring an already-installed one.
pub fn try_init_logging(config: &LogConfig) {
    install(config, true);
}

fn install(config: &LogConfig, lenient: bool) {
    let span_events = if config.show_span_events {
        FmtSpan::ENTER | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let base = fmt::layer()
        .with_thread_ids(config.show_thread_ids)
        .with_target(config.show_target)
        .with_span_events(span_events);

    let layer: Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync> = match config.format {
        LogFormat::Pretty => Box::new(base.pretty()),
        LogFormat::Compact => Box::new(base.compact()),
        LogFormat::Json => Box::new(base.json()),
    };
    let subscriber = tracing_subscriber::registry().with(layer.with_filter(env_filter(config)));
    if lenient {
        let _ = subscriber.try_init();
    } else {
        subscriber.init();
    }
}
