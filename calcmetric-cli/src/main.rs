//! Materializes one metric for one project and time range.
//!
//! Configured through `V3_`-prefixed environment variables. Exits with `0` when the
//! metric table changed, `66` when there was nothing to write and `1` on failure.

use std::process::ExitCode;
use std::time::Instant;

use calcmetric_config::shared::MetricConfig;
use calcmetric_telemetry::tracing::init_tracing;
use tracing::{error, info};

use crate::config::load_metric_config;
use crate::core::{FinalState, run_metric_calculation};
use crate::error::{RunnerError, RunnerResult};

mod config;
mod core;
mod error;

fn main() -> ExitCode {
    let started_at = Instant::now();

    let config = match load_metric_config() {
        Ok(config) => config,
        Err(err) => {
            eprint!("{}", err.render_report());
            return FinalState::Failed.exit_code();
        }
    };

    let _log_flusher = match init_tracing(env!("CARGO_BIN_NAME"), config.debug) {
        Ok(log_flusher) => log_flusher,
        Err(err) => {
            eprint!("{}", RunnerError::config(err).render_report());
            return FinalState::Failed.exit_code();
        }
    };

    let state = match run(config) {
        Ok(state) => state,
        Err(err) => {
            error!("{err}");
            eprint!("{}", err.render_report());
            FinalState::Failed
        }
    };

    info!(elapsed = ?started_at.elapsed(), %state, "finished");

    state.exit_code()
}

/// Runs the calculation on a single threaded runtime.
fn run(config: MetricConfig) -> RunnerResult<FinalState> {
    let outcome = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(run_metric_calculation(config))?;

    Ok(FinalState::from(outcome))
}
