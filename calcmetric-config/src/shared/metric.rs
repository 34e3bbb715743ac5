use std::collections::BTreeMap;

use secrecy::{ExposeSecret, SecretString};
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer};

use crate::shared::ValidationError;

/// Directory searched for query templates when `V3_SQL_PATH` is not set.
const DEFAULT_SQL_PATH: &str = "./sql/";

/// Configuration of a single metric calculation.
///
/// Every field maps to a `V3_`-prefixed environment variable, for example `project_slug`
/// is read from `V3_PROJECT_SLUG`. Boolean fields are flags: they are set when the
/// variable is present, whatever its value.
///
/// This intentionally does not implement `Serialize` to avoid leaking the connection
/// string.
#[derive(Clone, Debug, Deserialize)]
pub struct MetricConfig {
    /// Postgres connection string.
    pub conn: SecretString,
    /// Name of the metric, used to locate `<sql_path><metric>.sql`.
    pub metric: String,
    /// Base name of the destination table.
    pub table: String,
    /// Identifier of the project the metric is computed for.
    pub project_slug: String,
    /// Time-range code, such as `7d`, `30dp` or `c`.
    pub time_range: String,
    /// Directory containing query templates.
    #[serde(default)]
    pub sql_path: Option<String>,
    /// Drop the destination table before doing anything else.
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub drop: bool,
    /// Store each project in its own table, suffixed with the project slug.
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub ppt: bool,
    /// Recompute even when a computation record already exists.
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub force_calc: bool,
    /// Lower bound of a custom (`c`) time range.
    #[serde(default)]
    pub date_from: Option<String>,
    /// Upper bound of a custom (`c`) time range.
    #[serde(default)]
    pub date_to: Option<String>,
    /// Substituted into `{{limit}}` when non-empty.
    #[serde(default)]
    pub limit: Option<String>,
    /// Substituted into `{{offset}}` when non-empty.
    #[serde(default)]
    pub offset: Option<String>,
    /// Comma-separated columns that get an extra index.
    #[serde(default)]
    pub indexed_columns: Option<String>,
    /// Comma-separated key dimensions (`tr`, `ps`, `df`, `dt`) to delete before computing.
    #[serde(default)]
    pub delete: Option<String>,
    /// Delete superseded windows after a successful computation.
    #[serde(default, deserialize_with = "deserialize_non_empty_flag")]
    pub cleanup: bool,
    /// Log generated statements and their parameters.
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub debug: bool,
    /// Pass unknown column types through to the table definition verbatim.
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub guess_type: bool,
    /// Resolve `7d`/`7dp` from today instead of the start of the week.
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub calc_week_daily: bool,
    /// Resolve `30d`/`30dp` as 30 days back from today instead of calendar months.
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub calc_month_daily: bool,
    /// Resolve `q`/`qp` from today instead of the start of the quarter.
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub calc_quarter_daily: bool,
    /// Resolve `y`/`yp` from today instead of the start of the year.
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub calc_year_daily: bool,
    /// Resolve `2y`/`2yp` from today instead of the start of the biennium.
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub calc_year2_daily: bool,
    /// Named template parameters collected from `V3_PARAM_<name>` variables.
    #[serde(skip)]
    pub params: BTreeMap<String, String>,
}

impl MetricConfig {
    /// Validates that required values are not empty and the connection string parses.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let required = [
            ("conn", self.conn.expose_secret().as_str()),
            ("metric", self.metric.as_str()),
            ("table", self.table.as_str()),
            ("project_slug", self.project_slug.as_str()),
            ("time_range", self.time_range.as_str()),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ValidationError::EmptyValue(name));
            }
        }

        self.conn
            .expose_secret()
            .parse::<tokio_postgres::Config>()
            .map_err(|err| ValidationError::InvalidConnectionString(err.to_string()))?;

        Ok(())
    }

    /// Returns the name of the table the metric is materialized into.
    ///
    /// In per-project mode the project slug, lowercased and with `-` replaced by `_`,
    /// is appended to the base table name.
    pub fn destination_table(&self) -> String {
        if self.ppt {
            format!("{}_{}", self.table, to_db_identifier(&self.project_slug))
        } else {
            self.table.clone()
        }
    }

    /// Returns the directory containing query templates.
    pub fn sql_path(&self) -> &str {
        self.sql_path.as_deref().unwrap_or(DEFAULT_SQL_PATH)
    }

    /// Returns the columns that should receive an extra index.
    pub fn indexed_columns(&self) -> Vec<&str> {
        self.indexed_columns
            .as_deref()
            .map(|columns| {
                columns
                    .split(',')
                    .map(str::trim)
                    .filter(|column| !column.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn to_db_identifier(value: &str) -> String {
    value.to_lowercase().replace('-', "_")
}

/// Deserializes a flag, which is `true` whenever the variable is present.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    IgnoredAny::deserialize(deserializer)?;

    Ok(true)
}

/// Deserializes a flag that is only set when the variable has a non-empty value.
fn deserialize_non_empty_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;

    Ok(!value.is_empty())
}

#[cfg(test)]
mod tests {
    use crate::load_config_from;

    use super::*;

    fn config(extra: &[(&str, &str)]) -> MetricConfig {
        let mut vars = vec![
            ("V3_CONN", "host=localhost user=postgres"),
            ("V3_METRIC", "contributors"),
            ("V3_TABLE", "metric_contributors"),
            ("V3_PROJECT_SLUG", "Open-Telemetry"),
            ("V3_TIME_RANGE", "q"),
        ];
        vars.extend_from_slice(extra);

        load_config_from(
            vars.into_iter()
                .map(|(key, value)| (key.to_string(), value.to_string())),
        )
        .unwrap()
    }

    #[test]
    fn test_destination_table_shared() {
        assert_eq!(config(&[]).destination_table(), "metric_contributors");
    }

    #[test]
    fn test_destination_table_per_project() {
        assert_eq!(
            config(&[("V3_PPT", "")]).destination_table(),
            "metric_contributors_open_telemetry"
        );
    }

    #[test]
    fn test_sql_path_default() {
        assert_eq!(config(&[]).sql_path(), "./sql/");
        assert_eq!(
            config(&[("V3_SQL_PATH", "/templates/")]).sql_path(),
            "/templates/"
        );
    }

    #[test]
    fn test_cleanup_requires_value() {
        assert!(!config(&[("V3_CLEANUP", "")]).cleanup);
        assert!(config(&[("V3_CLEANUP", "1")]).cleanup);
    }

    #[test]
    fn test_indexed_columns_skip_blanks() {
        let config = config(&[("V3_INDEXED_COLUMNS", "author, ,repo,")]);
        assert_eq!(config.indexed_columns(), vec!["author", "repo"]);
    }

    #[test]
    fn test_validate_rejects_empty_values() {
        let err = config(&[("V3_METRIC", "")]).validate();
        // the later entry wins when the same key appears twice
        assert!(matches!(err, Err(ValidationError::EmptyValue("metric"))));
    }

    #[test]
    fn test_validate_accepts_config() {
        assert!(config(&[]).validate().is_ok());
    }
}
