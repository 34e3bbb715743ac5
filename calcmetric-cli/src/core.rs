use std::fmt;
use std::process::ExitCode;

use calcmetric::calculator::{CalculationOutcome, MetricCalculator};
use calcmetric::store::postgres::PgMetricStore;
use calcmetric_config::shared::MetricConfig;
use tracing::info;

use crate::error::RunnerResult;

/// Exit code telling the scheduler that nothing had to be written.
const EXIT_CODE_SKIPPED: u8 = 66;

/// How the invocation ended, as reported to the scheduler through the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalState {
    /// The metric table changed.
    Calculated,
    /// The metric was fresh, or was recomputed without any change.
    Skipped,
    Failed,
}

impl FinalState {
    pub fn code(&self) -> u8 {
        match self {
            FinalState::Calculated => 0,
            FinalState::Skipped => EXIT_CODE_SKIPPED,
            FinalState::Failed => 1,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }
}

impl From<CalculationOutcome> for FinalState {
    fn from(outcome: CalculationOutcome) -> Self {
        match outcome {
            CalculationOutcome::Calculated(_) => FinalState::Calculated,
            CalculationOutcome::Skipped | CalculationOutcome::Unchanged(_) => FinalState::Skipped,
        }
    }
}

impl fmt::Display for FinalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalState::Calculated => write!(f, "calculated"),
            FinalState::Skipped => write!(f, "skipped"),
            FinalState::Failed => write!(f, "failed"),
        }
    }
}

/// Connects to the database of `config` and runs the calculation it describes.
///
/// The connection is closed when this returns, whatever the outcome.
pub async fn run_metric_calculation(config: MetricConfig) -> RunnerResult<CalculationOutcome> {
    info!(
        metric = %config.metric,
        table = %config.destination_table(),
        project_slug = %config.project_slug,
        time_range = %config.time_range,
        "starting metric calculation"
    );

    let store = PgMetricStore::connect(&config.conn).await?;
    let outcome = MetricCalculator::new(store, config).run().await?;

    Ok(outcome)
}
