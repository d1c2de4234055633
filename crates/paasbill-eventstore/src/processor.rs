//! Background processing
//!
//! Periodically rebuilds the billable components from the raw events and
//! consolidates finished months. A second loop publishes the accumulated
//! cost per plan as gauges.

use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::EventStore;

/// Configuration for the processor loops
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Pause between two refresh runs
    pub schedule: Duration,
    /// Pause between two updates of the total cost gauges
    pub metrics_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            schedule: Duration::from_secs(8 * 60 * 60),
            metrics_interval: Duration::from_secs(10),
        }
    }
}

/// Drives refresh and consolidation of an [`EventStore`]
#[derive(Clone)]
pub struct Processor {
    store: EventStore,
    config: ProcessorConfig,
}

impl Processor {
    pub fn new(store: EventStore, config: ProcessorConfig) -> Self {
        Self { store, config }
    }

    /// One refresh followed by consolidation. Consolidation is skipped when
    /// the refresh fails.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> paasbill_common::Result<()> {
        let summary = self.store.refresh().await?;
        info!(intervals = summary.intervals, "Processor refresh complete");
        let months = self.store.consolidate_all().await?;
        if months > 0 {
            info!(months, "Processor consolidation complete");
        }
        Ok(())
    }

    /// Runs until `token` is cancelled. Cancellation is observed between
    /// runs, an operation in progress finishes first.
    pub async fn run(&self, token: CancellationToken) {
        info!(schedule = ?self.config.schedule, "Starting processor");
        loop {
            if let Err(err) = self.run_once().await {
                error!(error = %err, "Processor run failed");
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.schedule) => {}
            }
        }
        info!("Processor stopped");
    }

    /// Publishes `total_cost_gbp` per plan until `token` is cancelled
    pub async fn run_metrics(&self, token: CancellationToken) {
        loop {
            match self.store.get_total_cost().await {
                Ok(totals) => {
                    let gauges = &self.store.metrics().total_cost_gbp;
                    for total in totals {
                        let plan_guid = total.plan_guid.to_string();
                        gauges
                            .with_label_values(&[plan_guid.as_str()])
                            .set(total.cost.to_f64().unwrap_or_default());
                    }
                }
                Err(err) => warn!(error = %err, "Failed to update total cost metrics"),
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.metrics_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EngineConfig, StoreMetrics};
    use paasbill_common::Config;

    async fn processor() -> Processor {
        let mut config = EngineConfig::default().with_database_url("sqlite::memory:");
        config.max_connections = 1;
        let store = EventStore::connect(config, Config::default(), StoreMetrics::new().unwrap())
            .await
            .unwrap();
        store.init().await.unwrap();
        Processor::new(
            store,
            ProcessorConfig {
                schedule: Duration::from_secs(3600),
                metrics_interval: Duration::from_secs(3600),
            },
        )
    }

    #[tokio::test]
    async fn test_run_once_on_empty_store() {
        processor().await.run_once().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_during_sleep() {
        let processor = processor().await;
        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let processor = processor.clone();
            let token = token.clone();
            async move { processor.run(token).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
