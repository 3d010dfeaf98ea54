//! # Observability
//!
//! Logging setup for the event relay binaries.
//!
//! Binaries call [`init_with_config`] once at startup and use the standard
//! `tracing` macros everywhere else. Output is either a compact human
//! format on stderr or JSON lines (one object per event) on stdout or in an
//! append-only file.
//!
//! ```rust,ignore
//! fn main() {
//!     observability::init_with_config(observability::LogConfig {
//!         service_name: "event-relay".into(),
//!         default_level: "debug".into(),
//!         json: true,
//!         ..Default::default()
//!     })
//!     .expect("logging");
//! }
//! ```
//!
//! `RUST_LOG` overrides `default_level` when set.

mod json_layer;
mod writer;

pub use json_layer::{JsonLayer, LogLine};
pub use writer::AppendWriter;

use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, included in every JSON line.
    pub service_name: String,

    /// Default filter (e.g. "info", "event_relay=debug").
    /// Overridden by `RUST_LOG`.
    pub default_level: String,

    /// Emit JSON lines instead of the compact human format.
    pub json: bool,

    /// Write JSON lines to this file instead of stdout.
    pub log_path: Option<PathBuf>,

    /// With `log_path` set, also emit compact logs to stderr.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            json: false,
            log_path: None,
            also_stderr: false,
        }
    }
}

/// Logging initialisation error.
#[derive(Error, Debug)]
pub enum InitError {
    #[error("failed to open log file: {0}")]
    Io(#[from] io::Error),

    #[error("a global subscriber is already installed: {0}")]
    AlreadyInitialized(String),
}

/// Initialize logging with the default settings for `service_name`.
pub fn init(service_name: &str) -> Result<(), InitError> {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    })
}

/// Initialize logging.
///
/// Fails if the log file cannot be opened or if a global subscriber has
/// already been installed.
pub fn init_with_config(config: LogConfig) -> Result<(), InitError> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.default_level))
    };

    let registry = tracing_subscriber::registry();

    let result = match (&config.log_path, config.json) {
        (Some(path), _) => {
            let writer = AppendWriter::open(path)?;
            let stderr = config.also_stderr.then(|| compact_layer().with_filter(filter()));
            registry
                .with(JsonLayer::new(config.service_name.clone(), writer).with_filter(filter()))
                .with(stderr)
                .try_init()
        }
        (None, true) => registry
            .with(JsonLayer::new(config.service_name.clone(), io::stdout).with_filter(filter()))
            .try_init(),
        (None, false) => registry.with(compact_layer().with_filter(filter())).try_init(),
    };

    result.map_err(|e| InitError::AlreadyInitialized(e.to_string()))?;

    if let Some(path) = &config.log_path {
        tracing::debug!(log_path = %path.display(), "observability initialized");
    }

    Ok(())
}

fn compact_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .with_writer(io::stderr)
}

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};
