//! Statements that remove rows or tables outside of a computation.
//!
//! - Drop destroys a metric table unconditionally.
//! - Delete removes the rows matching a non-empty subset of the computation key.
//! - Cleanup removes windows superseded by the current one once a day has passed.

use std::fmt;

use pg_escape::quote_identifier;

use crate::bail;
use crate::error::{ErrorKind, MetricResult};
use crate::types::{ComputationKey, TextParam};

/// A statement with its text parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceStatement {
    pub sql: String,
    pub params: Vec<TextParam>,
}

/// Key dimensions a delete is restricted to.
///
/// Written as a comma separated list of `tr` (time range), `ps` (project slug), `df` (date
/// from) and `dt` (date to).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteFilter {
    pub time_range: bool,
    pub project_slug: bool,
    pub date_from: bool,
    pub date_to: bool,
}

impl DeleteFilter {
    /// Parses a filter such as `tr,ps`. Blank entries are ignored.
    pub fn parse(value: &str) -> MetricResult<Self> {
        let mut filter = DeleteFilter::default();

        for token in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token {
                "tr" => filter.time_range = true,
                "ps" => filter.project_slug = true,
                "df" => filter.date_from = true,
                "dt" => filter.date_to = true,
                _ => bail!(
                    ErrorKind::ConfigError,
                    "Unknown delete filter",
                    format!("unknown delete filter '{token}', expected one of tr, ps, df, dt")
                ),
            }
        }

        Ok(filter)
    }

    /// Returns `true` when no dimension is selected.
    pub fn is_empty(&self) -> bool {
        !(self.time_range || self.project_slug || self.date_from || self.date_to)
    }

    /// Returns `true` when a row identified by `row` is selected for deletion by a
    /// computation identified by `key`.
    pub fn matches(&self, key: &ComputationKey, row: &ComputationKey) -> bool {
        !self.is_empty()
            && (!self.time_range || key.time_range == row.time_range)
            && (!self.project_slug || key.project_slug == row.project_slug)
            && (!self.date_from || key.window.from == row.window.from)
            && (!self.date_to || key.window.to == row.window.to)
    }
}

impl fmt::Display for DeleteFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tokens: Vec<&str> = [
            (self.time_range, "tr"),
            (self.project_slug, "ps"),
            (self.date_from, "df"),
            (self.date_to, "dt"),
        ]
        .into_iter()
        .filter_map(|(selected, token)| selected.then_some(token))
        .collect();

        f.write_str(&tokens.join(","))
    }
}

/// Builds the statement dropping `table`.
pub fn build_drop_sql(table: &str) -> String {
    format!("drop table if exists {}", quote_identifier(table))
}

/// Builds the delete statement for the dimensions of `key` selected by `filter`.
///
/// Returns [`None`] for an empty filter, which would otherwise wipe the whole table.
pub fn build_delete_sql(
    table: &str,
    filter: &DeleteFilter,
    key: &ComputationKey,
) -> Option<MaintenanceStatement> {
    if filter.is_empty() {
        return None;
    }

    let candidates = [
        (filter.time_range, "time_range", key.time_range.clone()),
        (filter.project_slug, "project_slug", key.project_slug.clone()),
        (filter.date_from, "date_from", key.window.from.to_string()),
        (filter.date_to, "date_to", key.window.to.to_string()),
    ];

    let mut conditions = Vec::new();
    let mut params = Vec::new();
    for (selected, column, value) in candidates {
        if selected {
            params.push(TextParam::from(value));
            conditions.push(format!("{column} = ${}", params.len()));
        }
    }

    Some(MaintenanceStatement {
        sql: format!(
            "delete from {} where {}",
            quote_identifier(table),
            conditions.join(" and ")
        ),
        params,
    })
}

/// Builds the statement removing windows of the same time range and project that both
/// start and end before the window of `key`, and were computed before today.
pub fn build_cleanup_sql(table: &str, key: &ComputationKey) -> MaintenanceStatement {
    MaintenanceStatement {
        sql: format!(
            "delete from {} where time_range = $1 and project_slug = $2 and date_from < $3 and date_to < $4 and date(last_calculated_at) < date(now())",
            quote_identifier(table)
        ),
        params: vec![
            TextParam::from(key.time_range.as_str()),
            TextParam::from(key.project_slug.as_str()),
            TextParam::from(key.window.from.to_string()),
            TextParam::from(key.window.to.to_string()),
        ],
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use insta::assert_snapshot;

    use super::*;
    use crate::types::DateWindow;

    fn key(time_range: &str, project_slug: &str, from: u32, to: u32) -> ComputationKey {
        ComputationKey::new(
            time_range,
            project_slug,
            DateWindow::new(
                NaiveDate::from_ymd_opt(2024, from, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, to, 1).unwrap(),
            ),
        )
    }

    #[test]
    fn test_parse_filter() {
        let filter = DeleteFilter::parse("tr, df,").unwrap();
        assert_eq!(
            filter,
            DeleteFilter {
                time_range: true,
                date_from: true,
                ..Default::default()
            }
        );
        assert_eq!(filter.to_string(), "tr,df");

        assert!(DeleteFilter::parse("").unwrap().is_empty());
        assert!(DeleteFilter::parse(" , ").unwrap().is_empty());
    }

    #[test]
    fn test_parse_filter_rejects_unknown_token() {
        let err = DeleteFilter::parse("tr,all").unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConfigError);
        assert_eq!(
            err.detail(),
            Some("unknown delete filter 'all', expected one of tr, ps, df, dt")
        );
    }

    #[test]
    fn test_delete_sql() {
        let filter = DeleteFilter::parse("ps,dt").unwrap();
        let statement =
            build_delete_sql("metric_contributors", &filter, &key("30d", "kubernetes", 4, 5))
                .unwrap();

        assert_snapshot!(statement.sql, @"delete from metric_contributors where project_slug = $1 and date_to = $2");
        assert_eq!(
            statement.params,
            vec![TextParam::from("kubernetes"), TextParam::from("2024-05-01")]
        );
    }

    #[test]
    fn test_delete_sql_refuses_empty_filter() {
        let filter = DeleteFilter::default();
        assert!(build_delete_sql("metric_contributors", &filter, &key("30d", "k8s", 4, 5)).is_none());
    }

    #[test]
    fn test_filter_matches() {
        let current = key("30d", "kubernetes", 4, 5);
        let filter = DeleteFilter::parse("tr").unwrap();

        assert!(filter.matches(&current, &key("30d", "prometheus", 1, 2)));
        assert!(!filter.matches(&current, &key("7d", "kubernetes", 4, 5)));
        assert!(!DeleteFilter::default().matches(&current, &current));

        let filter = DeleteFilter::parse("tr,ps,df,dt").unwrap();
        assert!(filter.matches(&current, &current));
        assert!(!filter.matches(&current, &key("30d", "kubernetes", 3, 5)));
    }

    #[test]
    fn test_cleanup_sql() {
        let statement = build_cleanup_sql("metric_contributors", &key("30d", "kubernetes", 4, 5));

        assert_snapshot!(statement.sql, @"delete from metric_contributors where time_range = $1 and project_slug = $2 and date_from < $3 and date_to < $4 and date(last_calculated_at) < date(now())");
        assert_eq!(statement.params[2], TextParam::from("2024-04-01"));
        assert_eq!(statement.params[3], TextParam::from("2024-05-01"));
    }

    #[test]
    fn test_drop_sql() {
        assert_eq!(
            build_drop_sql("metric_contributors_open_telemetry"),
            "drop table if exists metric_contributors_open_telemetry"
        );
        assert_eq!(
            build_drop_sql("Metric"),
            "drop table if exists \"Metric\""
        );
    }
}
