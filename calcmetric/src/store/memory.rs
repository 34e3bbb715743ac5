use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, Utc};
use tokio::sync::Mutex;
use tracing::info;

use crate::ddl::build_table_ddl;
use crate::error::{ErrorKind, MetricResult};
use crate::maintenance::{DeleteFilter, build_drop_sql};
use crate::schema::infer_columns;
use crate::store::base::{ComputationRecord, MaterializeRequest, MetricStore};
use crate::types::{ColumnDescriptor, ComputationKey, DateWindow, SourceColumn, TextParam};
use crate::upsert::{UpsertBatcher, UpsertReport, UpsertStatement};
use crate::{bail, metric_error};

/// Canned result of a metric query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub columns: Vec<SourceColumn>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl QueryResult {
    pub fn new(columns: Vec<SourceColumn>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Appends a row, `None` being SQL `NULL`.
    pub fn with_row(mut self, values: &[Option<&str>]) -> Self {
        self.rows
            .push(values.iter().map(|value| value.map(str::to_owned)).collect());
        self
    }
}

/// A row of a metric table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricRow {
    pub key: ComputationKey,
    pub row_number: u64,
    pub last_calculated_at: NaiveDateTime,
    pub values: Vec<Option<String>>,
}

/// A metric table, rows kept in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricTable {
    pub columns: Vec<ColumnDescriptor>,
    pub rows: Vec<MetricRow>,
}

impl MetricTable {
    /// Returns the rows of the computation identified by `key`, ordered by row number.
    pub fn computation_rows(&self, key: &ComputationKey) -> Vec<&MetricRow> {
        let mut rows: Vec<&MetricRow> = self.rows.iter().filter(|row| &row.key == key).collect();
        rows.sort_by_key(|row| row.row_number);

        rows
    }
}

#[derive(Debug)]
struct Inner {
    query_results: HashMap<String, QueryResult>,
    tables: HashMap<String, MetricTable>,
    statements: Vec<String>,
    batch_params: Vec<usize>,
    today: Option<NaiveDate>,
}

/// In-memory metric store for testing and development purposes.
///
/// Queries are not interpreted: their results are registered up front with
/// [`MemoryMetricStore::set_query_result`]. Everything else goes through the same schema
/// inference, DDL and batching as a database backed store, and the generated statements
/// are recorded so they can be inspected afterward.
#[derive(Debug, Clone)]
pub struct MemoryMetricStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryMetricStore {
    /// Creates a new empty memory store.
    pub fn new() -> Self {
        let inner = Inner {
            query_results: HashMap::new(),
            tables: HashMap::new(),
            statements: Vec::new(),
            batch_params: Vec::new(),
            today: None,
        };

        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Registers the result returned when `query` runs.
    ///
    /// Queries are matched after trimming surrounding whitespace.
    pub async fn set_query_result(&self, query: &str, result: QueryResult) {
        let mut inner = self.inner.lock().await;
        inner
            .query_results
            .insert(query.trim().to_owned(), result);
    }

    /// Overrides the current day used by cleanups, which is the UTC date by default.
    pub async fn set_today(&self, today: NaiveDate) {
        let mut inner = self.inner.lock().await;
        inner.today = Some(today);
    }

    /// Returns a copy of `table`, if it exists.
    pub async fn table(&self, table: &str) -> Option<MetricTable> {
        let inner = self.inner.lock().await;
        inner.tables.get(table).cloned()
    }

    /// Returns the names of every existing table.
    pub async fn table_names(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut names: Vec<String> = inner.tables.keys().cloned().collect();
        names.sort();

        names
    }

    /// Returns every DDL and upsert statement issued so far, in order.
    pub async fn statements(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.statements.clone()
    }

    /// Returns the number of bound parameters of every upsert statement issued so far.
    pub async fn batch_params(&self) -> Vec<usize> {
        let inner = self.inner.lock().await;
        inner.batch_params.clone()
    }

    /// Inserts rows into `table` as if written on `calculated_at` by computation `key`.
    ///
    /// The table must exist.
    pub async fn insert_rows(
        &self,
        table: &str,
        key: &ComputationKey,
        calculated_at: NaiveDateTime,
        rows: Vec<Vec<Option<String>>>,
    ) -> MetricResult<()> {
        let mut inner = self.inner.lock().await;
        let Some(metric_table) = inner.tables.get_mut(table) else {
            bail!(
                ErrorKind::DestinationTableMissing,
                "Destination table does not exist",
                format!("relation \"{table}\" does not exist")
            );
        };

        for (idx, values) in rows.into_iter().enumerate() {
            metric_table.rows.push(MetricRow {
                key: key.clone(),
                row_number: idx as u64 + 1,
                last_calculated_at: calculated_at,
                values,
            });
        }

        Ok(())
    }
}

impl Default for MemoryMetricStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricStore for MemoryMetricStore {
    fn name() -> &'static str {
        "memory"
    }

    async fn drop_table(&self, table: &str) -> MetricResult<()> {
        let mut inner = self.inner.lock().await;

        info!("dropping table {}", table);

        inner.statements.push(build_drop_sql(table));
        inner.tables.remove(table);

        Ok(())
    }

    async fn is_computed(
        &self,
        table: &str,
        key: &ComputationKey,
    ) -> MetricResult<Option<ComputationRecord>> {
        let inner = self.inner.lock().await;

        let record = inner.tables.get(table).and_then(|metric_table| {
            metric_table
                .rows
                .iter()
                .find(|row| &row.key == key)
                .map(|row| ComputationRecord {
                    last_calculated_at: row.last_calculated_at,
                })
        });

        Ok(record)
    }

    async fn delete_rows(
        &self,
        table: &str,
        filter: &DeleteFilter,
        key: &ComputationKey,
    ) -> MetricResult<u64> {
        let mut inner = self.inner.lock().await;

        let Some(metric_table) = inner.tables.get_mut(table) else {
            return Ok(0);
        };

        let before = metric_table.rows.len();
        metric_table.rows.retain(|row| !filter.matches(key, &row.key));
        let deleted = (before - metric_table.rows.len()) as u64;

        info!("deleted {} rows of table {} matching {}", deleted, table, filter);

        Ok(deleted)
    }

    async fn cleanup_rows(&self, table: &str, key: &ComputationKey) -> MetricResult<u64> {
        let mut inner = self.inner.lock().await;

        let today = inner.today.unwrap_or_else(|| Utc::now().date_naive());
        let Some(metric_table) = inner.tables.get_mut(table) else {
            bail!(
                ErrorKind::DestinationTableMissing,
                "Destination table does not exist",
                format!("relation \"{table}\" does not exist")
            );
        };

        let before = metric_table.rows.len();
        metric_table.rows.retain(|row| {
            let superseded = row.key.time_range == key.time_range
                && row.key.project_slug == key.project_slug
                && row.key.window.from < key.window.from
                && row.key.window.to < key.window.to
                && row.last_calculated_at.date() < today;

            !superseded
        });
        let deleted = (before - metric_table.rows.len()) as u64;

        info!("cleaned up {} rows of table {}", deleted, table);

        Ok(deleted)
    }

    async fn materialize(&self, request: &MaterializeRequest<'_>) -> MetricResult<UpsertReport> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let Some(result) = inner.query_results.get(request.query.trim()).cloned() else {
            bail!(
                ErrorKind::QueryFailed,
                "Query has no registered result",
                request.query.trim()
            );
        };

        let columns = infer_columns(&result.columns, request.guess_type)?;

        let ddl = build_table_ddl(
            request.table,
            &columns,
            request.per_project,
            request.indexed_columns,
        );
        inner.statements.extend(ddl);
        let metric_table = inner
            .tables
            .entry(request.table.to_owned())
            .or_insert_with(|| MetricTable {
                columns: columns.clone(),
                rows: Vec::new(),
            });
        ensure_same_columns(request.table, &metric_table.columns, &columns)?;

        let mut batcher =
            UpsertBatcher::new(request.table, &columns, request.key, request.calculated_at)
                .with_max_params(request.max_params);
        let width = batcher.row_width();

        let mut statements = Vec::new();
        for values in result.rows {
            if let Some(statement) = batcher.push_row(values)? {
                statements.push(statement);
            }
        }
        statements.extend(batcher.finish());

        let mut report = UpsertReport::default();
        for statement in statements {
            let affected = apply_upsert(metric_table, width, &statement)?;
            report.record_batch(statement.row_count, affected);
            inner.batch_params.push(statement.params.len());
            inner.statements.push(statement.sql);
        }

        info!(
            "materialized {} rows into table {} in {} batches, {} affected",
            report.rows, request.table, report.batches, report.affected
        );

        Ok(report)
    }
}

fn ensure_same_columns(
    table: &str,
    existing: &[ColumnDescriptor],
    incoming: &[ColumnDescriptor],
) -> MetricResult<()> {
    for column in incoming {
        if !existing.iter().any(|existing| existing.name == column.name) {
            bail!(
                ErrorKind::QueryFailed,
                "Column does not exist in the metric table",
                format!(
                    "column \"{}\" of relation \"{table}\" does not exist",
                    column.name
                )
            );
        }
    }
    if existing.len() != incoming.len() {
        bail!(
            ErrorKind::QueryFailed,
            "Metric table has different columns",
            format!(
                "relation \"{table}\" has {} value columns, the query returns {}",
                existing.len(),
                incoming.len()
            )
        );
    }

    Ok(())
}

/// Applies `statement` the way its `on conflict` clause would, returning the number of
/// inserted or updated rows.
fn apply_upsert(
    table: &mut MetricTable,
    width: usize,
    statement: &UpsertStatement,
) -> MetricResult<u64> {
    let mut affected = 0;

    for params in statement.params.chunks(width) {
        let incoming = decode_row(params)?;

        let existing = table
            .rows
            .iter_mut()
            .find(|row| row.key == incoming.key && row.row_number == incoming.row_number);
        match existing {
            Some(row) if row.values == incoming.values => {}
            Some(row) => {
                row.values = incoming.values;
                affected += 1;
            }
            None => {
                table.rows.push(incoming);
                affected += 1;
            }
        }
    }

    Ok(affected)
}

/// Decodes the parameters bound for one row of an upsert statement.
fn decode_row(params: &[TextParam]) -> MetricResult<MetricRow> {
    let [time_range, project_slug, calculated_at, from, to, row_number, values @ ..] = params
    else {
        bail!(
            ErrorKind::InvalidData,
            "Upsert row is missing identity values",
            format!("got {} parameters", params.len())
        );
    };

    let row_number = required(row_number, "row_number")?
        .parse::<u64>()
        .map_err(|err| {
            metric_error!(
                ErrorKind::InvalidData,
                "Invalid row number",
                err.to_string(),
                source: err
            )
        })?;

    Ok(MetricRow {
        key: ComputationKey::new(
            required(time_range, "time_range")?,
            required(project_slug, "project_slug")?,
            DateWindow::new(
                required(from, "date_from")?.parse::<NaiveDate>()?,
                required(to, "date_to")?.parse::<NaiveDate>()?,
            ),
        ),
        row_number,
        last_calculated_at: NaiveDateTime::parse_from_str(
            required(calculated_at, "last_calculated_at")?,
            "%Y-%m-%d %H:%M:%S%.f",
        )?,
        values: values.iter().map(|value| value.0.clone()).collect(),
    })
}

fn required<'a>(param: &'a TextParam, column: &str) -> MetricResult<&'a str> {
    param.as_deref().ok_or_else(|| {
        metric_error!(
            ErrorKind::InvalidData,
            "Null value in a not null column",
            format!("column \"{column}\" cannot be null")
        )
    })
}
