use calcmetric_config::shared::{CALCMETRIC_OPTIONS, connection_config};
use chrono::NaiveDateTime;
use futures::StreamExt;
use secrecy::SecretString;
use tokio::pin;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Connection, NoTls, SimpleQueryMessage, Socket};
use tracing::{Instrument, debug, error, info, warn};

use crate::ddl::build_table_ddl;
use crate::error::{ErrorKind, MetricError, MetricResult};
use crate::maintenance::{DeleteFilter, build_cleanup_sql, build_delete_sql, build_drop_sql};
use crate::metric_error;
use crate::schema::infer_columns;
use crate::store::base::{ComputationRecord, MaterializeRequest, MetricStore};
use crate::types::{ComputationKey, SourceColumn, TextParam, display_params};
use crate::upsert::{UpsertBatcher, UpsertReport, UpsertStatement};

/// Server-side cursor holding the result of the metric query while it is upserted.
const RESULT_CURSOR: &str = "calcmetric_result";

/// Spawns the task driving `connection`.
///
/// The task ends when the [`Client`] that owns the other half of the connection is dropped.
fn spawn_postgres_connection(connection: Connection<Socket, tokio_postgres::tls::NoTlsStream>) {
    let span = tracing::Span::current();
    let task = async move {
        match connection.await {
            Err(err) => error!("an error occurred during the postgres connection: {}", err),
            Ok(()) => debug!("postgres connection terminated successfully"),
        }
    }
    .instrument(span);

    tokio::spawn(task);
}

/// A [`MetricStore`] backed by a PostgreSQL database.
#[derive(Debug)]
pub struct PgMetricStore {
    client: Client,
}

impl PgMetricStore {
    /// Wraps an already connected client.
    ///
    /// The session settings of the client are used as is. Values are rendered as text by
    /// the server, so metric tables written through a client with a different `datestyle`
    /// or `timezone` than [`CALCMETRIC_OPTIONS`] may hold differently formatted values.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connects to the database described by `conn` with the calculation session options.
    pub async fn connect(conn: &SecretString) -> MetricResult<Self> {
        let config = connection_config(conn, Some(&CALCMETRIC_OPTIONS)).map_err(|err| {
            metric_error!(
                ErrorKind::ConfigError,
                "Invalid connection string",
                err.to_string(),
                source: err
            )
        })?;

        let (client, connection) = config.connect(NoTls).await?;
        spawn_postgres_connection(connection);

        info!("connected to postgres");

        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Executes `sql` with text `params`, returning the number of affected rows.
    async fn execute(&self, sql: &str, params: &[TextParam]) -> MetricResult<u64> {
        debug!(sql, params = %display_params(params), "executing statement");

        self.client
            .execute(sql, &as_sql_params(params))
            .await
            .map_err(|err| with_statement(MetricError::from(err), sql, params))
    }

    /// Executes `sql` like [`PgMetricStore::execute`], reporting a missing table as
    /// [`ErrorKind::DestinationTableMissing`].
    async fn execute_on_table(&self, sql: &str, params: &[TextParam]) -> MetricResult<u64> {
        debug!(sql, params = %display_params(params), "executing statement");

        match self.client.execute(sql, &as_sql_params(params)).await {
            Ok(affected) => Ok(affected),
            Err(err) if is_undefined_table(&err) => Err(metric_error!(
                ErrorKind::DestinationTableMissing,
                "Destination table does not exist",
                server_message(&err),
                source: err
            )),
            Err(err) => Err(with_statement(MetricError::from(err), sql, params)),
        }
    }

    /// Upserts the rows carried by `statement`.
    async fn execute_upsert(&self, statement: &UpsertStatement) -> MetricResult<u64> {
        debug!(
            rows = statement.row_count,
            params = statement.params.len(),
            "executing upsert batch"
        );

        self.client
            .execute(&statement.sql, &as_sql_params(&statement.params))
            .await
            .map_err(|err| with_statement(MetricError::from(err), &statement.sql, &statement.params))
    }

    /// Upserts every row of [`RESULT_CURSOR`], one fetch at a time.
    ///
    /// A fetch is streamed to its end before the statements it filled are executed, since the
    /// connection delivers responses in order. The last partial statement is left in `batcher`.
    async fn upsert_from_cursor(&self, batcher: &mut UpsertBatcher) -> MetricResult<UpsertReport> {
        let fetch = format!("fetch forward {} from {RESULT_CURSOR}", batcher.batch_rows());
        let mut report = UpsertReport::default();

        loop {
            let rows = self
                .client
                .simple_query_raw(&fetch)
                .await
                .map_err(|err| with_statement(MetricError::from(err), &fetch, &[]))?;
            pin!(rows);

            let mut fetched = 0usize;
            let mut statements = Vec::new();
            while let Some(message) = rows.next().await {
                let message =
                    message.map_err(|err| with_statement(MetricError::from(err), &fetch, &[]))?;
                let SimpleQueryMessage::Row(row) = message else {
                    continue;
                };
                fetched += 1;

                let values = (0..row.len())
                    .map(|idx| row.try_get(idx).map(|value| value.map(str::to_owned)))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|err| {
                        metric_error!(
                            ErrorKind::InvalidData,
                            "Invalid value in query result",
                            err.to_string(),
                            source: err
                        )
                    })?;

                statements.extend(batcher.push_row(values)?);
            }

            for statement in statements {
                let affected = self.execute_upsert(&statement).await?;
                report.record_batch(statement.row_count, affected);
            }

            if fetched == 0 {
                return Ok(report);
            }
        }
    }

    /// Describes the result columns of `query` without running it.
    async fn describe(&self, query: &str) -> MetricResult<Vec<SourceColumn>> {
        let statement = self
            .client
            .prepare(query)
            .await
            .map_err(|err| with_statement(MetricError::from(err), query, &[]))?;

        Ok(statement
            .columns()
            .iter()
            .map(|column| SourceColumn::new(column.name(), column.type_().name()))
            .collect())
    }
}

impl MetricStore for PgMetricStore {
    fn name() -> &'static str {
        "postgres"
    }

    async fn drop_table(&self, table: &str) -> MetricResult<()> {
        let sql = build_drop_sql(table);
        self.execute(&sql, &[]).await?;

        info!(table, "dropped metric table");

        Ok(())
    }

    async fn is_computed(
        &self,
        table: &str,
        key: &ComputationKey,
    ) -> MetricResult<Option<ComputationRecord>> {
        let sql = format!(
            "select last_calculated_at from {} where project_slug = $1 and time_range = $2 and date_from = $3 and date_to = $4 limit 1",
            pg_escape::quote_identifier(table)
        );
        let params = [
            TextParam::from(key.project_slug.as_str()),
            TextParam::from(key.time_range.as_str()),
            TextParam::from(key.window.from.to_string()),
            TextParam::from(key.window.to.to_string()),
        ];
        let row = match self.client.query_opt(&sql, &as_sql_params(&params)).await {
            Ok(row) => row,
            Err(err) if is_undefined_table(&err) => {
                debug!(table, "metric table does not exist yet");
                return Ok(None);
            }
            Err(err) => return Err(with_statement(MetricError::from(err), &sql, &params)),
        };

        let Some(row) = row else {
            return Ok(None);
        };

        let last_calculated_at: NaiveDateTime = row.try_get(0).map_err(|err| {
            metric_error!(
                ErrorKind::InvalidData,
                "Invalid last_calculated_at value",
                format!("table '{table}': {err}"),
                source: err
            )
        })?;

        Ok(Some(ComputationRecord { last_calculated_at }))
    }

    async fn delete_rows(
        &self,
        table: &str,
        filter: &DeleteFilter,
        key: &ComputationKey,
    ) -> MetricResult<u64> {
        let Some(statement) = build_delete_sql(table, filter, key) else {
            warn!(table, "refusing to delete without any filter");
            return Ok(0);
        };

        match self.execute_on_table(&statement.sql, &statement.params).await {
            Ok(deleted) => Ok(deleted),
            Err(err) if err.kind() == ErrorKind::DestinationTableMissing => {
                debug!(table, "nothing to delete, metric table does not exist");
                Ok(0)
            }
            Err(err) => Err(err),
        }
    }

    async fn cleanup_rows(&self, table: &str, key: &ComputationKey) -> MetricResult<u64> {
        let statement = build_cleanup_sql(table, key);

        self.execute_on_table(&statement.sql, &statement.params)
            .await
    }

    async fn materialize(&self, request: &MaterializeRequest<'_>) -> MetricResult<UpsertReport> {
        let source_columns = self.describe(request.query).await?;
        let columns = infer_columns(&source_columns, request.guess_type)?;

        for sql in build_table_ddl(
            request.table,
            &columns,
            request.per_project,
            request.indexed_columns,
        ) {
            debug!(sql = %sql, "ensuring metric table");
            self.client
                .batch_execute(&sql)
                .await
                .map_err(|err| with_statement(MetricError::from(err), &sql, &[]))?;
        }

        let mut batcher = UpsertBatcher::new(
            request.table,
            &columns,
            request.key,
            request.calculated_at,
        )
        .with_max_params(request.max_params);

        let declare = format!(
            "declare {RESULT_CURSOR} no scroll cursor with hold for {}",
            request.query.trim().trim_end_matches(';')
        );
        self.client
            .batch_execute(&declare)
            .await
            .map_err(|err| with_statement(MetricError::from(err), &declare, &[]))?;

        let result = self.upsert_from_cursor(&mut batcher).await;

        let close = format!("close {RESULT_CURSOR}");
        if let Err(err) = self.client.batch_execute(&close).await {
            warn!(error = %err, "failed to close the result cursor");
        }

        let mut report = result?;
        if let Some(statement) = batcher.finish() {
            let affected = self.execute_upsert(&statement).await?;
            report.record_batch(statement.row_count, affected);
        }

        Ok(report)
    }
}

fn is_undefined_table(err: &tokio_postgres::Error) -> bool {
    err.code() == Some(&SqlState::UNDEFINED_TABLE)
}

fn server_message(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db_error) => db_error.message().to_owned(),
        None => err.to_string(),
    }
}

/// Attaches the failed statement and its parameters to `err` and logs it.
fn with_statement(err: MetricError, sql: &str, params: &[TextParam]) -> MetricError {
    let params = display_params(params);
    error!(sql, %params, "statement failed");

    err.with_context(format!("statement: {sql}\nparams: {params}"))
}

fn as_sql_params(params: &[TextParam]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|param| param as &(dyn ToSql + Sync))
        .collect()
}
