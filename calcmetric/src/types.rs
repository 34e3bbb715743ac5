//! Core data types shared across the calculation pipeline.

use std::error::Error;
use std::fmt;

use bytes::BytesMut;
use chrono::{Days, NaiveDate};
use tokio_postgres::types::{Format, IsNull, ToSql, Type, to_sql_checked};

/// Half-open day interval `[from, to)` a metric is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateWindow {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self { from, to }
    }

    /// Returns the number of days covered by the window.
    pub fn days(&self) -> i64 {
        (self.to - self.from).num_days()
    }

    /// Returns the window moved `days` days earlier.
    pub fn shifted_back(&self, days: u64) -> Option<Self> {
        Some(Self {
            from: self.from.checked_sub_days(Days::new(days))?,
            to: self.to.checked_sub_days(Days::new(days))?,
        })
    }

    /// Returns `true` when the window contains at least one day.
    pub fn is_empty(&self) -> bool {
        self.from >= self.to
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

/// Identity of one computation: every row written by a calculation shares it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComputationKey {
    /// Time-range code as configured, for example `30dp`.
    pub time_range: String,
    pub project_slug: String,
    pub window: DateWindow,
}

impl ComputationKey {
    pub fn new(
        time_range: impl Into<String>,
        project_slug: impl Into<String>,
        window: DateWindow,
    ) -> Self {
        Self {
            time_range: time_range.into(),
            project_slug: project_slug.into(),
            window,
        }
    }
}

/// Column metadata reported by the database for a query result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceColumn {
    pub name: String,
    /// Type name as reported by the driver, for example `int8` or `varchar`.
    pub type_name: String,
    /// `None` when the driver does not report nullability.
    pub nullable: Option<bool>,
}

impl SourceColumn {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable: None,
        }
    }
}

/// Canonical type of a value column in a metric table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Text,
    Boolean,
    Date,
    Interval,
    Numeric,
    BigInt,
    Timestamp,
    /// Type name passed through verbatim when type guessing is enabled.
    Guessed(String),
}

impl ColumnType {
    /// Returns the SQL type used in the table definition.
    pub fn as_sql(&self) -> &str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::Interval => "interval",
            ColumnType::Numeric => "numeric",
            ColumnType::BigInt => "bigint",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Guessed(name) => name,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// A value column of a metric table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: Option<bool>,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: None,
        }
    }
}

/// A statement parameter sent to Postgres in text format.
///
/// The server infers the parameter type from the statement and parses the text into it,
/// so every value can be carried as a string whatever its destination column type.
/// `None` binds SQL `NULL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextParam(pub Option<String>);

impl TextParam {
    pub fn null() -> Self {
        Self(None)
    }

    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl From<String> for TextParam {
    fn from(value: String) -> Self {
        Self(Some(value))
    }
}

impl From<&str> for TextParam {
    fn from(value: &str) -> Self {
        Self(Some(value.to_owned()))
    }
}

impl fmt::Display for TextParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(value) => write!(f, "'{value}'"),
            None => f.write_str("NULL"),
        }
    }
}

impl ToSql for TextParam {
    fn to_sql(
        &self,
        _ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match &self.0 {
            Some(value) => {
                out.extend_from_slice(value.as_bytes());
                Ok(IsNull::No)
            }
            None => Ok(IsNull::Yes),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        Format::Text
    }

    to_sql_checked!();
}

/// Renders parameters as a compact `[$1='a', $2=NULL]` list for logs and error details.
pub fn display_params(params: &[TextParam]) -> String {
    let rendered: Vec<String> = params
        .iter()
        .enumerate()
        .map(|(index, param)| format!("${}={param}", index + 1))
        .collect();

    format!("[{}]", rendered.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_window_days_and_shift() {
        let window = DateWindow::new(date(2024, 3, 1), date(2024, 3, 8));
        assert_eq!(window.days(), 7);
        assert_eq!(window.to_string(), "[2024-03-01, 2024-03-08)");

        let shifted = window.shifted_back(7).unwrap();
        assert_eq!(shifted, DateWindow::new(date(2024, 2, 23), date(2024, 3, 1)));
        assert!(!shifted.is_empty());
    }

    #[test]
    fn test_text_param_encoding() {
        let mut out = BytesMut::new();
        let param = TextParam::from("42");
        assert!(matches!(
            param.to_sql(&Type::INT8, &mut out).unwrap(),
            IsNull::No
        ));
        assert_eq!(&out[..], b"42");
        assert!(matches!(param.encode_format(&Type::INT8), Format::Text));

        let mut out = BytesMut::new();
        assert!(matches!(
            TextParam::null().to_sql(&Type::TEXT, &mut out).unwrap(),
            IsNull::Yes
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn test_display_params() {
        let params = vec![TextParam::from("7d"), TextParam::null()];
        assert_eq!(display_params(&params), "[$1='7d', $2=NULL]");
    }
}
