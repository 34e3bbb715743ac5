//! Calculation of one metric for one project and time range.

use calcmetric_config::shared::MetricConfig;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::MetricResult;
use crate::maintenance::DeleteFilter;
use crate::store::{MaterializeRequest, MetricStore};
use crate::template::{QueryTemplate, TemplateContext};
use crate::time_range::{TimeRange, WindowOptions, resolve_window};
use crate::types::ComputationKey;
use crate::upsert::{MAX_PLACEHOLDERS, UpsertReport};

/// How a calculation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalculationOutcome {
    /// The computation was already materialized, nothing ran.
    Skipped,
    /// The metric was computed but no row was inserted or updated.
    Unchanged(UpsertReport),
    /// The metric was computed and the table changed.
    Calculated(UpsertReport),
}

impl CalculationOutcome {
    /// Returns the upsert report when the metric was computed.
    pub fn report(&self) -> Option<&UpsertReport> {
        match self {
            CalculationOutcome::Skipped => None,
            CalculationOutcome::Unchanged(report) | CalculationOutcome::Calculated(report) => {
                Some(report)
            }
        }
    }

    /// Returns `true` when the metric table changed.
    pub fn changed(&self) -> bool {
        matches!(self, CalculationOutcome::Calculated(_))
    }
}

/// Materializes the metric described by a [`MetricConfig`] into a [`MetricStore`].
#[derive(Debug)]
pub struct MetricCalculator<S> {
    store: S,
    config: MetricConfig,
    template: Option<QueryTemplate>,
    now: DateTime<Utc>,
    max_params: usize,
}

impl<S> MetricCalculator<S>
where
    S: MetricStore,
{
    /// Creates a calculator for `config` evaluated at the current time.
    ///
    /// The query template is read from the template directory of `config` only when the
    /// metric has to be computed.
    pub fn new(store: S, config: MetricConfig) -> Self {
        Self {
            store,
            config,
            template: None,
            now: Utc::now(),
            max_params: MAX_PLACEHOLDERS,
        }
    }

    /// Uses `template` instead of reading it from disk.
    pub fn with_template(mut self, template: QueryTemplate) -> Self {
        self.template = Some(template);
        self
    }

    /// Evaluates time ranges and stamps rows as of `now`.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Overrides the bound parameter ceiling of upsert statements.
    pub fn with_max_params(mut self, max_params: usize) -> Self {
        self.max_params = max_params;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Runs the calculation.
    ///
    /// The table is dropped first when requested, then the window is resolved and the
    /// metric computed unless it already is. Requested deletes happen before deciding,
    /// so that a delete matching the current computation makes it run again.
    pub async fn run(&self) -> MetricResult<CalculationOutcome> {
        let table = self.config.destination_table();
        let range: TimeRange = self.config.time_range.parse()?;
        let options = WindowOptions::from_config(&self.config);

        if self.config.drop {
            info!(table = %table, "dropping metric table");
            self.store.drop_table(&table).await?;
        }

        let window = resolve_window(range, &options, self.now)?;
        let key = ComputationKey::new(range.code(), &self.config.project_slug, window);
        info!(
            table = %table,
            project_slug = %key.project_slug,
            time_range = %key.time_range,
            %window,
            "checking metric"
        );

        let mut needs_calculation = !self.is_computed(&table, &key).await?;

        if let Some(delete) = self.config.delete.as_deref() {
            let filter = DeleteFilter::parse(delete)?;
            if filter.is_empty() {
                warn!(
                    table = %table,
                    "ignoring delete without any filter, drop the table to remove every row"
                );
            } else {
                let deleted = self.store.delete_rows(&table, &filter, &key).await?;
                info!(table = %table, %filter, deleted, "deleted rows");

                if deleted > 0 {
                    needs_calculation = !self.is_computed(&table, &key).await?;
                }
            }
        }

        if !needs_calculation && self.config.force_calc {
            info!("forcing calculation");
            needs_calculation = true;
        }

        if !needs_calculation {
            info!(table = %table, %window, "metric is up to date, nothing to calculate");
            return Ok(CalculationOutcome::Skipped);
        }

        let query = self.render_query(&key).await?;
        let indexed_columns = self.config.indexed_columns();
        let request = MaterializeRequest {
            table: &table,
            query: &query,
            key: &key,
            calculated_at: self.now.naive_utc(),
            per_project: self.config.ppt,
            indexed_columns: &indexed_columns,
            guess_type: self.config.guess_type,
            max_params: self.max_params,
        };

        let report = self.store.materialize(&request).await?;
        info!(
            table = %table,
            rows = report.rows,
            batches = report.batches,
            affected = report.affected,
            "materialized metric"
        );

        if self.config.cleanup {
            let deleted = self.store.cleanup_rows(&table, &key).await?;
            if deleted > 0 {
                info!(table = %table, deleted, "cleaned up superseded windows");
            }
        }

        if report.changed() {
            Ok(CalculationOutcome::Calculated(report))
        } else {
            Ok(CalculationOutcome::Unchanged(report))
        }
    }

    async fn is_computed(&self, table: &str, key: &ComputationKey) -> MetricResult<bool> {
        match self.store.is_computed(table, key).await? {
            Some(record) => {
                info!(
                    table = %table,
                    last_calculated_at = %record.last_calculated_at,
                    "metric already calculated"
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn render_query(&self, key: &ComputationKey) -> MetricResult<String> {
        let context = TemplateContext::from_config(&self.config, key.window);

        let query = match &self.template {
            Some(template) => template.render(&context),
            None => {
                QueryTemplate::load(self.config.sql_path(), &self.config.metric)
                    .await?
                    .render(&context)
            }
        };
        debug!(sql = %query, "rendered metric query");

        Ok(query)
    }
}
