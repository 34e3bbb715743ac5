//! Batched multi-row upserts into metric tables.
//!
//! Rows are accumulated into a single `insert ... on conflict` statement until the next row
//! would push it to [`MAX_PLACEHOLDERS`] bound parameters, at which point the statement is
//! handed out to be executed and a new one is started. Every row carries the identity of the
//! computation followed by its value columns, all bound as text.

use chrono::NaiveDateTime;
use pg_escape::quote_identifier;

use crate::bail;
use crate::ddl::PRIMARY_KEY_COLUMNS;
use crate::error::{ErrorKind, MetricResult};
use crate::types::{ColumnDescriptor, ColumnType, ComputationKey, TextParam};

/// Maximum number of bound parameters in a single statement.
pub const MAX_PLACEHOLDERS: usize = 0x8000;

/// Number of identity parameters leading every row.
const IDENTITY_WIDTH: usize = 6;

/// Alias of the destination table inside upsert statements.
const EXISTING_ROW_ALIAS: &str = "existing";

/// Format of `last_calculated_at` values.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// A ready to execute upsert statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertStatement {
    pub sql: String,
    pub params: Vec<TextParam>,
    /// Number of rows carried by the statement.
    pub row_count: usize,
}

/// Summary of the upserts performed by one computation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    /// Rows streamed from the source query.
    pub rows: u64,
    /// Statements executed.
    pub batches: u64,
    /// Rows inserted or updated.
    pub affected: u64,
}

impl UpsertReport {
    /// Accounts for an executed statement.
    pub fn record_batch(&mut self, row_count: usize, affected: u64) {
        self.rows += row_count as u64;
        self.batches += 1;
        self.affected += affected;
    }

    /// Returns `true` when at least one row was inserted or updated.
    pub fn changed(&self) -> bool {
        self.affected > 0
    }
}

/// Accumulates result rows into bounded upsert statements.
#[derive(Debug)]
pub struct UpsertBatcher {
    /// `insert into ... values ` prefix shared by every statement.
    insert_prefix: String,
    /// `on conflict ...` suffix shared by every statement.
    conflict_clause: String,
    /// Identity parameters except `row_number`, which varies per row.
    identity: [TextParam; 5],
    value_columns: usize,
    max_params: usize,
    next_row_number: u64,
    tuples: Vec<String>,
    params: Vec<TextParam>,
}

impl UpsertBatcher {
    /// Creates a batcher writing rows of `key` into `table`, stamped with `calculated_at`.
    pub fn new(
        table: &str,
        columns: &[ColumnDescriptor],
        key: &ComputationKey,
        calculated_at: NaiveDateTime,
    ) -> Self {
        let column_names: Vec<String> = columns
            .iter()
            .map(|column| quote_identifier(&column.name).into_owned())
            .collect();

        let identity = [
            TextParam::from(key.time_range.as_str()),
            TextParam::from(key.project_slug.as_str()),
            TextParam::from(calculated_at.format(TIMESTAMP_FORMAT).to_string()),
            TextParam::from(key.window.from.to_string()),
            TextParam::from(key.window.to.to_string()),
        ];

        Self {
            insert_prefix: build_insert_prefix(table, &column_names),
            conflict_clause: build_conflict_clause(columns, &column_names),
            identity,
            value_columns: columns.len(),
            max_params: MAX_PLACEHOLDERS,
            next_row_number: 1,
            tuples: Vec::new(),
            params: Vec::new(),
        }
    }

    /// Overrides the parameter ceiling of each statement.
    pub fn with_max_params(mut self, max_params: usize) -> Self {
        self.max_params = max_params;
        self
    }

    /// Returns the number of parameters bound for each row.
    pub fn row_width(&self) -> usize {
        IDENTITY_WIDTH + self.value_columns
    }

    /// Returns the number of rows carried by a full statement.
    pub fn batch_rows(&self) -> usize {
        self.max_params
            .div_ceil(self.row_width())
            .saturating_sub(1)
            .max(1)
    }

    /// Appends a row of values, one per value column, `None` being SQL `NULL`.
    ///
    /// Returns a statement to execute when the batch is full, that is when one more row
    /// would reach the parameter ceiling.
    pub fn push_row(
        &mut self,
        values: Vec<Option<String>>,
    ) -> MetricResult<Option<UpsertStatement>> {
        if values.len() != self.value_columns {
            bail!(
                ErrorKind::InvalidData,
                "Row width does not match the result columns",
                format!(
                    "expected {} values, got {}",
                    self.value_columns,
                    values.len()
                )
            );
        }

        let width = self.row_width();
        let first = self.params.len() + 1;
        let placeholders: Vec<String> = (first..first + width).map(|n| format!("${n}")).collect();
        self.tuples.push(format!("({})", placeholders.join(", ")));

        self.params.extend(self.identity.iter().cloned());
        self.params
            .push(TextParam::from(self.next_row_number.to_string()));
        self.params.extend(values.into_iter().map(TextParam));
        self.next_row_number += 1;

        if self.params.len() + width >= self.max_params {
            return Ok(self.take_statement());
        }

        Ok(None)
    }

    /// Returns the statement holding the remaining rows, if any.
    pub fn finish(mut self) -> Option<UpsertStatement> {
        self.take_statement()
    }

    fn take_statement(&mut self) -> Option<UpsertStatement> {
        if self.tuples.is_empty() {
            return None;
        }

        let tuples = std::mem::take(&mut self.tuples);
        let sql = format!(
            "{}{} {}",
            self.insert_prefix,
            tuples.join(", "),
            self.conflict_clause
        );

        Some(UpsertStatement {
            sql,
            params: std::mem::take(&mut self.params),
            row_count: tuples.len(),
        })
    }
}

fn build_insert_prefix(table: &str, column_names: &[String]) -> String {
    let mut columns: Vec<&str> = vec![
        "time_range",
        "project_slug",
        "last_calculated_at",
        "date_from",
        "date_to",
        "row_number",
    ];
    columns.extend(column_names.iter().map(String::as_str));

    format!(
        "insert into {} as {EXISTING_ROW_ALIAS} ({}) values ",
        quote_identifier(table),
        columns.join(", ")
    )
}

/// Builds the conflict clause updating every value column that changed.
///
/// Rows whose values are identical are left untouched, so they do not count as affected.
/// Guessed types may lack an equality operator (`json`, `xml`, `point`), so they are
/// compared through their text representation.
fn build_conflict_clause(columns: &[ColumnDescriptor], column_names: &[String]) -> String {
    let conflict_target = format!("on conflict ({})", PRIMARY_KEY_COLUMNS.join(", "));

    let excluded: Vec<String> = column_names
        .iter()
        .map(|name| format!("excluded.{name}"))
        .collect();
    let compared = |alias: &str| -> Vec<String> {
        columns
            .iter()
            .zip(column_names)
            .map(|(column, name)| match column.column_type {
                ColumnType::Guessed(_) => format!("{alias}.{name}::text"),
                _ => format!("{alias}.{name}"),
            })
            .collect()
    };
    let existing_compared = compared(EXISTING_ROW_ALIAS);
    let excluded_compared = compared("excluded");

    match column_names {
        [] => format!("{conflict_target} do nothing"),
        [name] => format!(
            "{conflict_target} do update set {name} = {} where {} is distinct from {}",
            excluded[0], existing_compared[0], excluded_compared[0]
        ),
        _ => format!(
            "{conflict_target} do update set ({}) = ({}) where ({}) is distinct from ({})",
            column_names.join(", "),
            excluded.join(", "),
            existing_compared.join(", "),
            excluded_compared.join(", ")
        ),
    }
}
