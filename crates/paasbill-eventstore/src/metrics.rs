//! Prometheus metrics for the event store

use std::time::Instant;

use paasbill_common::{BillingError, Result};
use prometheus::{Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

const NAMESPACE: &str = "paas_billing_eventstore";

/// Collectors exposed by the event store
#[derive(Clone)]
pub struct StoreMetrics {
    /// Duration of store operations, labelled by function and outcome
    pub performance: HistogramVec,
    /// Placeholder plans generated for unconfigured plan GUIDs
    pub dummy_plans_created: IntCounterVec,
    /// Refreshes rejected because an event had no matching plan version
    pub inconsistent_plans: IntCounter,
    /// Currently valid conversion rate to GBP per currency
    pub currency_configured_ratio: GaugeVec,
    /// Currently valid VAT rate per code
    pub vat_configured_rate: GaugeVec,
    /// Accumulated cost per plan
    pub total_cost_gbp: GaugeVec,
}

fn metric_error(err: prometheus::Error) -> BillingError {
    BillingError::Internal(format!("metrics: {err}"))
}

impl StoreMetrics {
    pub fn new() -> Result<Self> {
        Ok(Self {
            performance: HistogramVec::new(
                HistogramOpts::new("performance", "Duration of event store operations in seconds")
                    .namespace(NAMESPACE)
                    .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
                &["function", "error"],
            )
            .map_err(metric_error)?,
            dummy_plans_created: IntCounterVec::new(
                Opts::new("dummy_plans_created", "Placeholder pricing plans generated")
                    .namespace(NAMESPACE),
                &["guid", "name"],
            )
            .map_err(metric_error)?,
            inconsistent_plans: IntCounter::with_opts(
                Opts::new(
                    "inconsistent_plans",
                    "Refreshes that found events without a pricing plan",
                )
                .namespace(NAMESPACE),
            )
            .map_err(metric_error)?,
            currency_configured_ratio: GaugeVec::new(
                Opts::new("currency_configured_ratio", "Configured conversion rate to GBP")
                    .namespace(NAMESPACE),
                &["code"],
            )
            .map_err(metric_error)?,
            vat_configured_rate: GaugeVec::new(
                Opts::new("vat_configured_rate", "Configured VAT rate").namespace(NAMESPACE),
                &["code"],
            )
            .map_err(metric_error)?,
            total_cost_gbp: GaugeVec::new(
                Opts::new("total_cost_gbp", "Accumulated cost per plan in GBP ex VAT")
                    .namespace(NAMESPACE),
                &["plan_guid"],
            )
            .map_err(metric_error)?,
        })
    }

    pub fn register(&self, registry: &prometheus::Registry) -> Result<()> {
        registry
            .register(Box::new(self.performance.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(self.dummy_plans_created.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(self.inconsistent_plans.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(self.currency_configured_ratio.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(self.vat_configured_rate.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(self.total_cost_gbp.clone()))
            .map_err(metric_error)?;
        Ok(())
    }

    /// Records how long `function` took and whether it failed
    pub fn observe(&self, function: &str, started: Instant, failed: bool) {
        let error = if failed { "true" } else { "false" };
        self.performance
            .with_label_values(&[function, error])
            .observe(started.elapsed().as_secs_f64());
    }

    pub fn currency_gauge(&self, code: &str) -> Gauge {
        self.currency_configured_ratio.with_label_values(&[code])
    }

    pub fn vat_gauge(&self, code: &str) -> Gauge {
        self.vat_configured_rate.with_label_values(&[code])
    }
}
