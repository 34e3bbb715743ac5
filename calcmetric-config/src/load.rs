use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::shared::MetricConfig;

/// Prefix shared by every recognized environment variable.
const ENV_PREFIX: &str = "V3";

/// Separator between environment variable prefix and key segments.
const ENV_PREFIX_SEPARATOR: &str = "_";

/// Separator for nested configuration keys in environment variables.
const ENV_SEPARATOR: &str = "__";

/// Prefix of the variables substituted as named parameters into query templates.
const PARAM_PREFIX: &str = "V3_PARAM_";

/// Variables that must be present for a calculation to run.
const REQUIRED_VARIABLES: &[&str] = &[
    "V3_CONN",
    "V3_METRIC",
    "V3_TABLE",
    "V3_PROJECT_SLUG",
    "V3_TIME_RANGE",
];

/// Errors that can occur while loading the metric configuration.
#[derive(Debug, Error)]
pub enum LoadConfigError {
    /// A required environment variable is not defined.
    #[error("you must define {0} environment variable to run this")]
    MissingVariable(&'static str),

    /// Environment variables failed to merge into the configuration.
    #[error("failed to load configuration from environment variables: {0}")]
    EnvironmentVariables(#[source] config::ConfigError),

    /// The variables were read but deserialization failed.
    #[error("failed to deserialize configuration: {0}")]
    Deserialization(#[source] config::ConfigError),
}

/// Loads the [`MetricConfig`] from the process environment.
///
/// Only `V3_`-prefixed variables are considered. `V3_PROJECT_SLUG` maps to the
/// `project_slug` field, and `V3_PARAM_<name>` variables become named template
/// parameters with their case preserved.
pub fn load_config() -> Result<MetricConfig, LoadConfigError> {
    load_config_from(std::env::vars())
}

/// Loads the [`MetricConfig`] from an explicit set of variables.
pub fn load_config_from<I>(variables: I) -> Result<MetricConfig, LoadConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let variables: HashMap<String, String> = variables
        .into_iter()
        .filter(|(key, _)| key.starts_with(ENV_PREFIX))
        .collect();

    for required in REQUIRED_VARIABLES {
        if !variables.contains_key(*required) {
            return Err(LoadConfigError::MissingVariable(required));
        }
    }

    let params = collect_params(&variables);

    let environment_source = config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .source(Some(variables));

    let settings = config::Config::builder()
        .add_source(environment_source)
        .build()
        .map_err(LoadConfigError::EnvironmentVariables)?;

    let mut metric_config = settings
        .try_deserialize::<MetricConfig>()
        .map_err(LoadConfigError::Deserialization)?;
    metric_config.params = params;

    Ok(metric_config)
}

/// Extracts `V3_PARAM_<name>` variables keyed by `<name>`.
fn collect_params(variables: &HashMap<String, String>) -> BTreeMap<String, String> {
    variables
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(PARAM_PREFIX)
                .filter(|name| !name.is_empty())
                .map(|name| (name.to_owned(), value.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    fn variables(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    fn required() -> Vec<(String, String)> {
        variables(&[
            ("V3_CONN", "host=localhost user=postgres dbname=metrics"),
            ("V3_METRIC", "contributors"),
            ("V3_TABLE", "metric_contributors"),
            ("V3_PROJECT_SLUG", "cncf/kubernetes"),
            ("V3_TIME_RANGE", "30d"),
        ])
    }

    #[test]
    fn test_load_required_variables() {
        let config = load_config_from(required()).unwrap();

        assert_eq!(
            config.conn.expose_secret(),
            "host=localhost user=postgres dbname=metrics"
        );
        assert_eq!(config.metric, "contributors");
        assert_eq!(config.table, "metric_contributors");
        assert_eq!(config.project_slug, "cncf/kubernetes");
        assert_eq!(config.time_range, "30d");
        assert!(!config.drop);
        assert!(!config.ppt);
        assert!(!config.force_calc);
        assert!(!config.debug);
        assert!(config.date_from.is_none());
        assert!(config.params.is_empty());
    }

    #[test]
    fn test_missing_required_variable() {
        let mut vars = required();
        vars.retain(|(key, _)| key != "V3_TABLE");

        let err = load_config_from(vars).unwrap_err();
        assert!(matches!(err, LoadConfigError::MissingVariable("V3_TABLE")));
        assert_eq!(
            err.to_string(),
            "you must define V3_TABLE environment variable to run this"
        );
    }

    #[test]
    fn test_flags_use_presence() {
        let mut vars = required();
        vars.extend(variables(&[
            ("V3_DROP", ""),
            ("V3_PPT", "1"),
            ("V3_FORCE_CALC", "no"),
            ("V3_CALC_MONTH_DAILY", "y"),
            ("V3_GUESS_TYPE", ""),
        ]));

        let config = load_config_from(vars).unwrap();

        assert!(config.drop);
        assert!(config.ppt);
        assert!(config.force_calc);
        assert!(config.calc_month_daily);
        assert!(config.guess_type);
        assert!(!config.calc_week_daily);
        assert!(!config.cleanup);
    }

    #[test]
    fn test_optional_values_and_params() {
        let mut vars = required();
        vars.extend(variables(&[
            ("V3_DATE_FROM", "2023-10"),
            ("V3_DATE_TO", "2023-11"),
            ("V3_LIMIT", "100"),
            ("V3_INDEXED_COLUMNS", "name,cnt"),
            ("V3_DELETE", "tr,ps"),
            ("V3_PARAM_Repo_Group", "'kubernetes'"),
            ("V3_PARAM_min", "5"),
            ("OTHER_PARAM_ignored", "x"),
        ]));

        let config = load_config_from(vars).unwrap();

        assert_eq!(config.date_from.as_deref(), Some("2023-10"));
        assert_eq!(config.date_to.as_deref(), Some("2023-11"));
        assert_eq!(config.limit.as_deref(), Some("100"));
        assert_eq!(config.offset, None);
        assert_eq!(config.indexed_columns(), vec!["name", "cnt"]);
        assert_eq!(config.delete.as_deref(), Some("tr,ps"));
        assert_eq!(config.params.len(), 2);
        assert_eq!(config.params["Repo_Group"], "'kubernetes'");
        assert_eq!(config.params["min"], "5");
    }
}
