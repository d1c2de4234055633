//! # PaaS Billing Event Store
//!
//! Storage and computation core of the billing engine.
//!
//! ## Pipeline
//!
//! ```text
//! raw events ──► normaliser ──► events ──► composer ──► billable_event_components
//!                                  ▲                              │
//!              reference data ─────┘                              ▼
//!                                        aggregator ──► live / consolidated reads
//! ```
//!
//! - [`metering`]: raw event ingest and the lifecycle normaliser
//! - [`pricing`]: formula language and slice composition against versioned reference data
//! - [`billing`]: aggregation into billable events, consolidation, forecasts and totals
//! - [`store::EventStore`]: the query façade used by the HTTP layer
//! - [`processor::Processor`]: periodic refresh and consolidation
//! - [`collector`]: periodic fetching of raw events from the platform

pub mod billing;
pub mod collector;
pub mod db;
pub mod metering;
pub mod metrics;
pub mod pricing;
pub mod processor;
pub mod reference;
pub mod rows;
pub mod schema;
pub mod store;

pub use metrics::StoreMetrics;
pub use processor::{Processor, ProcessorConfig};
pub use rows::EventRows;
pub use store::{EventStore, RefreshSummary};

use std::time::Duration;

use chrono::{DateTime, Utc};
use paasbill_common::types::range::{epoch, parse_instant};
use paasbill_common::{
    COMPUTE_SERVICE_GUID, CONSOLIDATION_LAG_DAYS, DEFAULT_COMPUTE_PLAN_GUID,
    DEFAULT_CONSOLIDATION_START_DATE, DEFAULT_STAGING_PLAN_GUID, DEFAULT_TASK_PLAN_GUID,
    INIT_TIMEOUT, QUERY_TIMEOUT, REFRESH_TIMEOUT, STORE_TIMEOUT,
};
use uuid::Uuid;

/// Plans assigned to platform-managed resources that carry no plan of their own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WellKnownPlans {
    /// Plan for running app instances
    pub compute_plan_guid: Uuid,
    /// Plan for one-off tasks
    pub task_plan_guid: Uuid,
    /// Plan for staging runs
    pub staging_plan_guid: Uuid,
    /// Service GUID reported on compute, task and staging intervals
    pub compute_service_guid: Uuid,
}

impl Default for WellKnownPlans {
    fn default() -> Self {
        Self {
            compute_plan_guid: DEFAULT_COMPUTE_PLAN_GUID,
            task_plan_guid: DEFAULT_TASK_PLAN_GUID,
            staging_plan_guid: DEFAULT_STAGING_PLAN_GUID,
            compute_service_guid: COMPUTE_SERVICE_GUID,
        }
    }
}

/// Event store configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite connection URL
    pub database_url: String,
    /// Maximum pooled connections
    pub max_connections: u32,
    /// Idle connections are closed after this long
    pub idle_timeout: Duration,
    /// Connections are recycled after this long
    pub max_lifetime: Duration,
    pub init_timeout: Duration,
    pub refresh_timeout: Duration,
    pub store_timeout: Duration,
    pub query_timeout: Duration,
    /// Rows buffered between a stream's producer task and its reader
    pub stream_buffer: usize,
    pub plans: WellKnownPlans,
    /// First month the consolidation backfill considers
    pub consolidation_start: DateTime<Utc>,
    /// Months ending after this stay live; `None` means five days ago
    pub consolidation_end: Option<DateTime<Utc>>,
    /// Billable events priced and written per consolidation round trip
    pub consolidation_page_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://paasbill.db".to_string(),
            max_connections: 10,
            idle_timeout: Duration::from_secs(10 * 60),
            max_lifetime: Duration::from_secs(60 * 60),
            init_timeout: INIT_TIMEOUT,
            refresh_timeout: REFRESH_TIMEOUT,
            store_timeout: STORE_TIMEOUT,
            query_timeout: QUERY_TIMEOUT,
            stream_buffer: 64,
            plans: WellKnownPlans::default(),
            consolidation_start: parse_instant(DEFAULT_CONSOLIDATION_START_DATE)
                .unwrap_or_else(epoch),
            consolidation_end: None,
            consolidation_page_size: 1000,
        }
    }
}

impl EngineConfig {
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_plans(mut self, plans: WellKnownPlans) -> Self {
        self.plans = plans;
        self
    }

    pub fn with_consolidation_page_size(mut self, size: usize) -> Self {
        self.consolidation_page_size = size.max(1);
        self
    }

    /// Upper bound of the consolidation backfill at `now`
    pub fn consolidation_end_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.consolidation_end
            .unwrap_or_else(|| now - chrono::Duration::days(CONSOLIDATION_LAG_DAYS))
    }
}
