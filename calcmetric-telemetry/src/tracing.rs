//! Structured logging for calcmetric binaries.
//!
//! Events are formatted by `tracing-subscriber` and written to stderr through a
//! non-blocking writer, so logging never stalls a running calculation.

use std::sync::Once;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum TracingError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("failed to install the tracing subscriber: {0}")]
    Init(#[from] TryInitError),
}

/// Flushes buffered log lines when dropped.
///
/// Keep it alive for the whole process lifetime, dropping it early loses events.
#[must_use = "dropping the flusher stops log output"]
pub struct LogFlusher {
    _guard: WorkerGuard,
}

/// Installs the global tracing subscriber for the binary named `app_name`.
///
/// The default level is `info` for calcmetric crates, `debug` when `debug` is set.
/// `RUST_LOG` takes precedence over both.
pub fn init_tracing(app_name: &str, debug: bool) -> Result<LogFlusher, TracingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directives(app_name, debug))?,
    };

    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        )
        .try_init()?;

    Ok(LogFlusher { _guard: guard })
}

/// Installs a subscriber writing to the test harness output.
///
/// Only does something when `ENABLE_TRACING` is set, and only once per process.
pub fn init_test_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        if std::env::var("ENABLE_TRACING").is_err() {
            return;
        }

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directives("calcmetric", true)));
        if let Err(err) = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
        {
            eprintln!("warning: failed to install the test subscriber: {err}");
        }
    });
}

fn default_directives(app_name: &str, debug: bool) -> String {
    let level = if debug { "debug" } else { "info" };
    let app_target = app_name.replace('-', "_");

    let mut directives = format!("warn,calcmetric={level}");
    if app_target != "calcmetric" {
        directives.push_str(&format!(",{app_target}={level}"));
    }

    directives
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives() {
        assert_eq!(
            default_directives("calcmetric", false),
            "warn,calcmetric=info"
        );
        assert_eq!(
            default_directives("calcmetric-cli", true),
            "warn,calcmetric=debug,calcmetric_cli=debug"
        );
    }

    #[test]
    fn test_default_directives_parse() {
        assert!(EnvFilter::try_new(default_directives("calcmetric", true)).is_ok());
    }
}
