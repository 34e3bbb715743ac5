use std::future::Future;

use chrono::NaiveDateTime;

use crate::error::MetricResult;
use crate::maintenance::DeleteFilter;
use crate::types::ComputationKey;
use crate::upsert::{MAX_PLACEHOLDERS, UpsertReport};

/// Evidence that a computation was already materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputationRecord {
    pub last_calculated_at: NaiveDateTime,
}

/// Everything needed to materialize the result of a metric query.
#[derive(Debug, Clone)]
pub struct MaterializeRequest<'a> {
    /// Destination table, already suffixed in per-project mode.
    pub table: &'a str,
    /// Rendered metric query.
    pub query: &'a str,
    pub key: &'a ComputationKey,
    /// Value of `last_calculated_at` for every row written.
    pub calculated_at: NaiveDateTime,
    pub per_project: bool,
    pub indexed_columns: &'a [&'a str],
    pub guess_type: bool,
    /// Bound parameter ceiling of each upsert statement.
    pub max_params: usize,
}

impl<'a> MaterializeRequest<'a> {
    pub fn new(
        table: &'a str,
        query: &'a str,
        key: &'a ComputationKey,
        calculated_at: NaiveDateTime,
    ) -> Self {
        Self {
            table,
            query,
            key,
            calculated_at,
            per_project: false,
            indexed_columns: &[],
            guess_type: false,
            max_params: MAX_PLACEHOLDERS,
        }
    }
}

/// Trait for systems holding metric tables.
///
/// Every operation addresses a table by its final name. Apart from freshness checks and
/// deletes, which treat a missing table as empty, every failure is reported to the caller
/// and ends the calculation.
pub trait MetricStore {
    /// Returns the name of the store.
    fn name() -> &'static str;

    /// Drops `table` if it exists.
    fn drop_table(&self, table: &str) -> impl Future<Output = MetricResult<()>> + Send;

    /// Returns the record of the computation identified by `key`, if any row of it exists.
    ///
    /// A missing table means nothing was computed yet and is not an error.
    fn is_computed(
        &self,
        table: &str,
        key: &ComputationKey,
    ) -> impl Future<Output = MetricResult<Option<ComputationRecord>>> + Send;

    /// Deletes the rows matching the dimensions of `key` selected by `filter`.
    ///
    /// An empty filter deletes nothing. Returns the number of deleted rows, zero when the
    /// table does not exist.
    fn delete_rows(
        &self,
        table: &str,
        filter: &DeleteFilter,
        key: &ComputationKey,
    ) -> impl Future<Output = MetricResult<u64>> + Send;

    /// Deletes windows of the same time range and project as `key` that precede it and
    /// were computed before today. Returns the number of deleted rows.
    fn cleanup_rows(
        &self,
        table: &str,
        key: &ComputationKey,
    ) -> impl Future<Output = MetricResult<u64>> + Send;

    /// Runs the query of `request`, creates the destination table from the shape of its
    /// result if needed and upserts every row into it.
    fn materialize(
        &self,
        request: &MaterializeRequest<'_>,
    ) -> impl Future<Output = MetricResult<UpsertReport>> + Send;
}
