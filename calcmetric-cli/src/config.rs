use calcmetric_config::load_config;
use calcmetric_config::shared::MetricConfig;

use crate::error::{RunnerError, RunnerResult};

/// Loads the metric configuration from the environment and validates it.
pub fn load_metric_config() -> RunnerResult<MetricConfig> {
    let config = load_config().map_err(RunnerError::config)?;
    config.validate().map_err(RunnerError::config)?;

    Ok(config)
}
