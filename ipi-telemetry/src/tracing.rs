//! Tracing subscriber setup for hosts embedding a lookup engine.

use std::path::PathBuf;
use std::sync::Once;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Environment variable enabling log output in tests.
const ENABLE_TEST_TRACING_ENV: &str = "ENABLE_TRACING";

static TEST_TRACING: Once = Once::new();

/// Output options of [`init_tracing`].
#[derive(Debug, Clone, Default)]
pub struct TracingOptions {
    /// Emits one JSON object per event instead of human readable lines.
    pub json: bool,
    /// Writes events to daily rotated files in this directory instead of stdout.
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to create log file appender in `{path}`: {source}")]
    Appender {
        path: PathBuf,
        source: tracing_appender::rolling::InitError,
    },

    #[error("failed to install the tracing subscriber: {0}")]
    Init(#[from] TryInitError),
}

/// Keeps the background writer of a file logger alive.
///
/// Buffered events are flushed when the value is dropped, so it must be held until the host exits.
#[must_use]
pub struct LogFlusher {
    _guard: Option<WorkerGuard>,
}

/// Installs the global tracing subscriber.
///
/// The filter is read from `RUST_LOG` and defaults to `{app_name}=info,ipi=info`.
pub fn init_tracing(app_name: &str, options: TracingOptions) -> Result<LogFlusher, TracingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{app_name}=info,ipi=info")));

    let (writer, guard) = match &options.log_dir {
        Some(log_dir) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(app_name)
                .filename_suffix("log")
                .build(log_dir)
                .map_err(|source| TracingError::Appender {
                    path: log_dir.clone(),
                    source,
                })?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (writer, Some(guard))
        }
        None => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
            (writer, Some(guard))
        }
    };

    let ansi = options.log_dir.is_none();
    let layer = if options.json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(writer)
            .boxed()
    } else {
        fmt::layer().with_ansi(ansi).with_writer(writer).boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()?;

    Ok(LogFlusher { _guard: guard })
}

/// Installs a test subscriber once per process.
///
/// Output is only produced when `ENABLE_TRACING` is set, so test logs stay quiet by default.
pub fn init_test_tracing() {
    TEST_TRACING.call_once(|| {
        if std::env::var(ENABLE_TEST_TRACING_ENV).is_err() {
            return;
        }

        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ipi=debug"));

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}
