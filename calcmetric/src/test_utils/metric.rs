use calcmetric_config::load_config_from;
use calcmetric_config::shared::MetricConfig;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};

/// Connection string used by configurations that never reach a database.
pub const UNUSED_CONN: &str = "host=localhost user=postgres dbname=unused";

/// Builds a configuration computing `metric` into `table`, with `extra` variables applied
/// on top of the required ones.
///
/// Later variables win, so `extra` can override any required variable.
pub fn metric_config(metric: &str, table: &str, extra: &[(&str, &str)]) -> MetricConfig {
    let mut variables = vec![
        ("V3_CONN", UNUSED_CONN),
        ("V3_METRIC", metric),
        ("V3_TABLE", table),
        ("V3_PROJECT_SLUG", "kubernetes"),
        ("V3_TIME_RANGE", "c"),
        ("V3_DATE_FROM", "2023-10"),
        ("V3_DATE_TO", "2023-11"),
    ];
    variables.extend_from_slice(extra);

    load_config_from(
        variables
            .into_iter()
            .map(|(key, value)| (key.to_owned(), value.to_owned())),
    )
    .expect("Failed to load the test configuration")
}

/// Returns the given UTC day at `hour` o'clock.
pub fn utc(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0)
        .single()
        .expect("invalid test timestamp")
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("invalid test date")
}
