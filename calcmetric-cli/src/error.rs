use std::error::Error;
use std::fmt::Write;

use calcmetric::error::MetricError;

/// Result type for the calcmetric binary.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Error type of the calcmetric binary.
///
/// Wraps [`MetricError`] for calculation failures and provides variants for errors
/// happening before a calculation starts.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The calculation failed.
    #[error(transparent)]
    Metric(#[from] MetricError),
    /// Configuration or logging setup error.
    #[error("configuration error: {0}")]
    Config(#[source] Box<dyn Error + Send + Sync>),
    /// I/O error, such as failing to start the runtime.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Creates a configuration error from any error.
    pub fn config<E: Error + Send + Sync + 'static>(err: E) -> Self {
        RunnerError::Config(Box::new(err))
    }

    /// Returns a short category label for this error.
    pub fn category(&self) -> &'static str {
        match self {
            RunnerError::Metric(_) => "calculation error",
            RunnerError::Config(_) => "configuration error",
            RunnerError::Io(_) => "i/o error",
        }
    }

    /// Returns a report for terminal output listing the chain of causes.
    ///
    /// Calculation errors include their backtrace when `RUST_BACKTRACE` is `1` or `full`.
    pub fn render_report(&self) -> String {
        let mut out = format!("calcmetric failed\ncategory: {}\nerror: {self}\n", self.category());

        let mut source = self.source();
        let mut idx = 1usize;
        while let Some(err) = source {
            let _ = writeln!(out, "cause {idx}: {err}");
            source = err.source();
            idx += 1;
        }

        let render_backtrace = matches!(
            std::env::var("RUST_BACKTRACE").as_deref(),
            Ok("1") | Ok("full")
        );
        if let (true, RunnerError::Metric(err)) = (render_backtrace, self) {
            let _ = writeln!(out, "backtrace:\n{}", err.backtrace());
        }

        out
    }
}
