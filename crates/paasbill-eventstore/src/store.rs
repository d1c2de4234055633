//! Event store façade
//!
//! Every public operation runs under its configured deadline and records its
//! duration in [`StoreMetrics::performance`]. Row streams are produced by a
//! spawned task that owns a read transaction, see [`EventRows`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use paasbill_common::types::range::format_instant;
use paasbill_common::{
    BillableEvent, BillingError, Config, CurrencyRate, EventFilter, EventKind, PricingPlan, RangeFilter,
    RawEvent, RawEventFilter, Result, TotalCost, UsageEvent, ValidationError, VatRate,
};
use sqlx::SqlitePool;
use tracing::{debug, error, info, instrument, warn};

use crate::billing::{self, consolidator, forecast, totals};
use crate::db::{self, storage_error, with_timeout};
use crate::metering::{self, normaliser::Normaliser, raw};
use crate::pricing::{composer, FormulaCache};
use crate::reference::{self, ReferenceData};
use crate::rows::{EventRows, RowSink};
use crate::{schema, EngineConfig, StoreMetrics};

/// Outcome of a [`EventStore::refresh`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub raw_events: usize,
    pub intervals: usize,
    pub components: usize,
    pub placeholder_plans: usize,
    pub malformed: BTreeMap<EventKind, usize>,
}

async fn observed<T, F>(
    metrics: &StoreMetrics,
    function: &'static str,
    limit: Duration,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let result = with_timeout(function, limit, fut).await;
    metrics.observe(function, started, result.is_err());
    if let Err(err) = &result {
        if err.is_client_error() {
            debug!(function, error = %err, "Rejected request");
        } else {
            error!(function, error = %err, "Event store operation failed");
        }
    }
    result
}

/// Storage and query façade over the billing database
#[derive(Clone)]
pub struct EventStore {
    pool: SqlitePool,
    config: EngineConfig,
    reference: Arc<Config>,
    metrics: StoreMetrics,
    formulas: Arc<FormulaCache>,
}

impl EventStore {
    pub fn new(pool: SqlitePool, config: EngineConfig, reference: Config, metrics: StoreMetrics) -> Self {
        Self {
            pool,
            config,
            reference: Arc::new(reference),
            metrics,
            formulas: Arc::new(FormulaCache::new()),
        }
    }

    /// Opens the pool described by `config`
    pub async fn connect(config: EngineConfig, reference: Config, metrics: StoreMetrics) -> Result<Self> {
        let pool = db::connect(&config).await?;
        Ok(Self::new(pool, config, reference, metrics))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creates the schema and loads the reference configuration
    #[instrument(skip(self))]
    pub async fn init(&self) -> Result<()> {
        observed(&self.metrics, "init", self.config.init_timeout, async {
            let mut tx = self.pool.begin().await.map_err(storage_error)?;
            schema::apply(&mut tx).await?;
            reference::apply_config(&mut tx, &self.reference).await?;
            let loaded = ReferenceData::load(&mut tx).await?;
            tx.commit().await.map_err(storage_error)?;

            reference::set_gauges(&self.metrics, &loaded, Utc::now());
            info!(
                pricing_plans = self.reference.pricing_plans.len(),
                "Initialised event store"
            );
            Ok(())
        })
        .await
    }

    /// Rebuilds usage intervals and component slices from every stored raw
    /// event. Runs as one write transaction, so readers see either the state
    /// before or after.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<RefreshSummary> {
        observed(&self.metrics, "refresh", self.config.refresh_timeout, async {
            let mut tx = self.pool.begin().await.map_err(storage_error)?;
            reference::apply_config(&mut tx, &self.reference).await?;

            let mut normaliser = Normaliser::new(self.config.plans);
            raw::replay(&mut tx, |event| normaliser.push(&event)).await?;
            let (intervals, normalised) = normaliser.finish();
            metering::replace_intervals(&mut tx, &intervals).await?;

            let placeholder_plans = if self.reference.ignore_missing_plans {
                reference::generate_missing_plans(&mut tx, &self.metrics).await?
            } else {
                0
            };
            reference::check_plan_consistency(&mut tx, &self.metrics).await?;

            let loaded = ReferenceData::load(&mut tx).await?;
            let slices = composer::compose_all(&intervals, &loaded);
            composer::replace_components(&mut tx, &slices).await?;
            tx.commit().await.map_err(storage_error)?;

            reference::set_gauges(&self.metrics, &loaded, Utc::now());
            let summary = RefreshSummary {
                raw_events: normalised.raw_events,
                intervals: intervals.len(),
                components: slices.len(),
                placeholder_plans,
                malformed: normalised.malformed,
            };
            for (kind, count) in &summary.malformed {
                warn!(kind = kind.as_str(), count, "Skipped malformed raw events");
            }
            info!(
                raw_events = summary.raw_events,
                intervals = summary.intervals,
                components = summary.components,
                "Refreshed billable components"
            );
            Ok(summary)
        })
        .await
    }

    /// Stores a batch of raw events, ignoring GUIDs already stored. Returns
    /// the number of new rows.
    #[instrument(skip(self, events), fields(count = events.len()))]
    pub async fn store_events(&self, events: &[RawEvent]) -> Result<u64> {
        observed(&self.metrics, "store_events", self.config.store_timeout, async {
            let mut tx = self.pool.begin().await.map_err(storage_error)?;
            let inserted = raw::insert_events(&mut tx, events).await?;
            tx.commit().await.map_err(storage_error)?;
            Ok(inserted)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn get_events(&self, filter: &RawEventFilter) -> Result<Vec<RawEvent>> {
        observed(&self.metrics, "get_events", self.config.query_timeout, async {
            let mut conn = self.pool.acquire().await.map_err(storage_error)?;
            raw::select_events(&mut conn, filter).await
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn get_event_rows(&self, filter: &RawEventFilter) -> Result<EventRows<RawEvent>> {
        let filter = filter.clone();
        let (pool, metrics, limit) = self.stream_parts();
        Ok(EventRows::spawn(self.config.stream_buffer, move |mut sink| async move {
            observed(&metrics, "get_events", limit, async {
                let mut tx = pool.begin().await.map_err(storage_error)?;
                raw::stream_events(&mut tx, &filter, &mut sink).await
            })
            .await
        }))
    }

    /// Usage events overlapping the range, clipped to it
    #[instrument(skip(self))]
    pub async fn get_usage_event_rows(&self, filter: &EventFilter) -> Result<EventRows<UsageEvent>> {
        filter.validate()?;
        let filter = filter.clone();
        let (pool, metrics, limit) = self.stream_parts();
        Ok(EventRows::spawn(self.config.stream_buffer, move |mut sink| async move {
            observed(&metrics, "get_usage_events", limit, async {
                let mut tx = pool.begin().await.map_err(storage_error)?;
                metering::usage_events(&mut tx, &filter, Utc::now(), &mut sink).await
            })
            .await
        }))
    }

    pub async fn get_usage_events(&self, filter: &EventFilter) -> Result<Vec<UsageEvent>> {
        self.get_usage_event_rows(filter).await?.collect().await
    }

    /// Billable events computed from the live component slices
    #[instrument(skip(self))]
    pub async fn get_billable_event_rows(&self, filter: &EventFilter) -> Result<EventRows<BillableEvent>> {
        filter.validate()?;
        let filter = filter.clone();
        let (pool, metrics, limit) = self.stream_parts();
        let formulas = self.formulas.clone();
        Ok(EventRows::spawn(self.config.stream_buffer, move |mut sink| async move {
            observed(&metrics, "get_billable_events", limit, async {
                let mut tx = pool.begin().await.map_err(storage_error)?;
                billing::live_billable_events(&mut tx, &filter, Utc::now(), &formulas, &mut sink).await
            })
            .await
        }))
    }

    pub async fn get_billable_events(&self, filter: &EventFilter) -> Result<Vec<BillableEvent>> {
        self.get_billable_event_rows(filter).await?.collect().await
    }

    /// Snapshot rows of consolidated months. The range must start and end on
    /// month boundaries.
    #[instrument(skip(self))]
    pub async fn get_consolidated_billable_event_rows(
        &self,
        filter: &EventFilter,
    ) -> Result<EventRows<BillableEvent>> {
        filter.validate()?;
        if !filter.is_month_aligned() {
            return Err(ValidationError::InvalidRange(format!(
                "consolidated billable events need a month aligned range, got [{}, {})",
                format_instant(&filter.range_start),
                format_instant(&filter.range_stop)
            ))
            .into());
        }
        let filter = filter.clone();
        let (pool, metrics, limit) = self.stream_parts();
        Ok(EventRows::spawn(self.config.stream_buffer, move |mut sink| async move {
            observed(&metrics, "get_consolidated_billable_events", limit, async {
                let mut tx = pool.begin().await.map_err(storage_error)?;
                for month in filter.split_by_month() {
                    consolidator::consolidated_billable_events(&mut tx, &month, &mut sink).await?;
                }
                Ok(())
            })
            .await
        }))
    }

    pub async fn get_consolidated_billable_events(&self, filter: &EventFilter) -> Result<Vec<BillableEvent>> {
        self.get_consolidated_billable_event_rows(filter).await?.collect().await
    }

    /// Billable events where consolidated months come from the snapshot and
    /// everything else is computed live, all within one read transaction
    #[instrument(skip(self))]
    pub async fn get_auto_billable_event_rows(&self, filter: &EventFilter) -> Result<EventRows<BillableEvent>> {
        filter.validate()?;
        let filter = filter.clone();
        let (pool, metrics, limit) = self.stream_parts();
        let formulas = self.formulas.clone();
        Ok(EventRows::spawn(self.config.stream_buffer, move |mut sink| async move {
            observed(&metrics, "get_auto_billable_events", limit, async {
                let mut tx = pool.begin().await.map_err(storage_error)?;
                billing::auto_billable_events(&mut tx, &filter, Utc::now(), &formulas, &mut sink).await
            })
            .await
        }))
    }

    pub async fn get_auto_billable_events(&self, filter: &EventFilter) -> Result<Vec<BillableEvent>> {
        self.get_auto_billable_event_rows(filter).await?.collect().await
    }

    #[instrument(skip(self))]
    pub async fn is_range_consolidated(&self, filter: &EventFilter) -> Result<bool> {
        filter.validate()?;
        observed(&self.metrics, "is_range_consolidated", self.config.query_timeout, async {
            let mut conn = self.pool.acquire().await.map_err(storage_error)?;
            consolidator::is_consolidated(&mut conn, filter).await
        })
        .await
    }

    /// Snapshots one whole month. Fails with `AlreadyConsolidated` when the
    /// month was consolidated before.
    #[instrument(skip(self))]
    pub async fn consolidate(&self, filter: &EventFilter) -> Result<usize> {
        consolidator::validate_filter(filter)?;
        observed(&self.metrics, "consolidate", self.config.refresh_timeout, async {
            let mut tx = self.pool.begin().await.map_err(storage_error)?;
            let count = consolidator::consolidate_range(
                &mut tx,
                filter,
                Utc::now(),
                &self.formulas,
                self.config.consolidation_page_size,
            )
            .await?;
            tx.commit().await.map_err(storage_error)?;
            Ok(count)
        })
        .await
    }

    /// Consolidates every whole month between `start` and `end` that is not
    /// consolidated yet, one transaction per month. Returns the number of
    /// months consolidated.
    #[instrument(skip(self))]
    pub async fn consolidate_full_months(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<usize> {
        let mut consolidated = 0;
        for month in consolidator::full_months(start, end) {
            if self.is_range_consolidated(&month).await? {
                continue;
            }
            match self.consolidate(&month).await {
                Ok(_) => consolidated += 1,
                // another process got there first
                Err(BillingError::AlreadyConsolidated(range)) => {
                    debug!(range = %range, "Month already consolidated");
                }
                Err(err) => return Err(err),
            }
        }
        if consolidated > 0 {
            info!(months = consolidated, "Consolidated full months");
        }
        Ok(consolidated)
    }

    /// Consolidates from the configured start up to the configured end, which
    /// defaults to a few days before now
    pub async fn consolidate_all(&self) -> Result<usize> {
        let end = self.config.consolidation_end_at(Utc::now());
        self.consolidate_full_months(self.config.consolidation_start, end).await
    }

    /// Prices hypothetical usage without storing it
    #[instrument(skip(self, inputs), fields(inputs = inputs.len()))]
    pub async fn forecast_billable_event_rows(
        &self,
        inputs: Vec<UsageEvent>,
        filter: &EventFilter,
    ) -> Result<EventRows<BillableEvent>> {
        filter.validate()?;
        forecast::validate_inputs(&inputs)?;
        let filter = filter.clone();
        let (pool, metrics, limit) = self.stream_parts();
        let formulas = self.formulas.clone();
        Ok(EventRows::spawn(self.config.stream_buffer, move |mut sink: RowSink<BillableEvent>| async move {
            observed(&metrics, "forecast_billable_events", limit, async {
                let mut tx = pool.begin().await.map_err(storage_error)?;
                let reference = ReferenceData::load(&mut tx).await?;
                drop(tx);
                for event in forecast::forecast(&inputs, &filter, &reference, Utc::now(), &formulas)? {
                    sink.push(event).await?;
                }
                Ok(())
            })
            .await
        }))
    }

    pub async fn forecast_billable_events(
        &self,
        inputs: Vec<UsageEvent>,
        filter: &EventFilter,
    ) -> Result<Vec<BillableEvent>> {
        self.forecast_billable_event_rows(inputs, filter).await?.collect().await
    }

    #[instrument(skip(self))]
    pub async fn get_pricing_plans(&self, filter: &RangeFilter) -> Result<Vec<PricingPlan>> {
        observed(&self.metrics, "get_pricing_plans", self.config.query_timeout, async {
            let mut conn = self.pool.acquire().await.map_err(storage_error)?;
            reference::get_pricing_plans(&mut conn, filter).await
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn get_vat_rates(&self, filter: &RangeFilter) -> Result<Vec<VatRate>> {
        observed(&self.metrics, "get_vat_rates", self.config.query_timeout, async {
            let mut conn = self.pool.acquire().await.map_err(storage_error)?;
            reference::get_vat_rates(&mut conn, filter).await
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn get_currency_rates(&self, filter: &RangeFilter) -> Result<Vec<CurrencyRate>> {
        observed(&self.metrics, "get_currency_rates", self.config.query_timeout, async {
            let mut conn = self.pool.acquire().await.map_err(storage_error)?;
            reference::get_currency_rates(&mut conn, filter).await
        })
        .await
    }

    /// Accumulated ex-VAT cost per plan over every stored slice
    #[instrument(skip(self))]
    pub async fn get_total_cost(&self) -> Result<Vec<TotalCost>> {
        observed(&self.metrics, "get_total_cost", self.config.query_timeout, async {
            let mut tx = self.pool.begin().await.map_err(storage_error)?;
            totals::total_cost(&mut tx, Utc::now(), &self.formulas).await
        })
        .await
    }

    /// Database liveness
    pub async fn ping(&self) -> Result<()> {
        with_timeout("ping", self.config.query_timeout, async {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(storage_error)?;
            Ok(())
        })
        .await
    }

    fn stream_parts(&self) -> (SqlitePool, StoreMetrics, Duration) {
        (self.pool.clone(), self.metrics.clone(), self.config.query_timeout)
    }
}
