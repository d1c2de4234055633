//! Raw event collection
//!
//! An [`EventCollector`] drives one [`EventFetcher`]: it looks up the newest
//! stored event of the fetcher's kind, asks for everything after it and
//! stores the batch. It polls quickly while catching up and slows down to
//! the regular schedule once a fetch brings nothing new.

pub mod cloudfoundry;

pub use cloudfoundry::{CfFetcherConfig, CfUsageEventFetcher};

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use paasbill_common::{EventKind, RawEvent, RawEventFilter, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::EventStore;

/// Source of raw events of a single kind
#[async_trait]
pub trait EventFetcher: Send + Sync {
    fn kind(&self) -> EventKind;

    /// Events created after `last_event`, oldest first. `None` fetches from
    /// the beginning.
    async fn fetch_events(&self, last_event: Option<&RawEvent>) -> Result<Vec<RawEvent>>;
}

/// Storage used by collectors
#[async_trait]
pub trait RawEventStore: Send + Sync {
    async fn store_events(&self, events: &[RawEvent]) -> Result<u64>;
    async fn get_events(&self, filter: &RawEventFilter) -> Result<Vec<RawEvent>>;
}

#[async_trait]
impl RawEventStore for EventStore {
    async fn store_events(&self, events: &[RawEvent]) -> Result<u64> {
        EventStore::store_events(self, events).await
    }

    async fn get_events(&self, filter: &RawEventFilter) -> Result<Vec<RawEvent>> {
        EventStore::get_events(self, filter).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    /// Just started, fetch immediately
    Syncing,
    /// More events are probably waiting, fetch again after the minimum wait
    Collecting,
    /// Caught up, fetch again on the regular schedule
    Scheduled,
}

/// Collector timing
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Wait between fetches once caught up
    pub schedule: Duration,
    /// Wait between fetches while catching up
    pub min_wait_time: Duration,
    /// Wait before the first fetch
    pub initial_wait_time: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            schedule: Duration::from_secs(15 * 60),
            min_wait_time: Duration::from_secs(3),
            initial_wait_time: Duration::ZERO,
        }
    }
}

/// Periodically moves events from a fetcher into the store
pub struct EventCollector {
    config: CollectorConfig,
    fetcher: Arc<dyn EventFetcher>,
    store: Arc<dyn RawEventStore>,
    state: CollectorState,
    events_collected: u64,
}

impl EventCollector {
    pub fn new(config: CollectorConfig, fetcher: Arc<dyn EventFetcher>, store: Arc<dyn RawEventStore>) -> Self {
        Self {
            config,
            fetcher,
            store,
            state: CollectorState::Syncing,
            events_collected: 0,
        }
    }

    pub fn state(&self) -> CollectorState {
        self.state
    }

    pub fn events_collected(&self) -> u64 {
        self.events_collected
    }

    /// Delay before the next fetch in the current state
    pub fn wait_duration(&self) -> Duration {
        match self.state {
            CollectorState::Syncing => self.config.initial_wait_time,
            CollectorState::Collecting => self.config.min_wait_time,
            CollectorState::Scheduled => self.config.schedule,
        }
    }

    async fn last_event(&self) -> Result<Option<RawEvent>> {
        let filter = RawEventFilter::new(self.fetcher.kind()).with_limit(1);
        Ok(self.store.get_events(&filter).await?.into_iter().next())
    }

    /// One fetch and store. Returns the number of events fetched.
    pub async fn collect(&mut self) -> Result<usize> {
        let last_event = self.last_event().await?;
        let events = self.fetcher.fetch_events(last_event.as_ref()).await?;
        self.store.store_events(&events).await?;

        let nothing_new = match (events.last(), &last_event) {
            (None, _) => true,
            (Some(newest), Some(last)) => newest.guid == last.guid,
            (Some(_), None) => false,
        };
        self.state = if nothing_new {
            CollectorState::Scheduled
        } else {
            CollectorState::Collecting
        };
        Ok(events.len())
    }

    /// Collects until `token` is cancelled. Errors are logged and the
    /// collector falls back to the regular schedule.
    pub async fn run(mut self, token: CancellationToken) {
        let kind = self.fetcher.kind();
        info!(kind = kind.as_str(), "Starting event collector");
        loop {
            let wait = self.wait_duration();
            info!(
                kind = kind.as_str(),
                state = ?self.state,
                next_collection = ?wait,
                events_collected = self.events_collected,
                "Collector status"
            );
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            let started = Instant::now();
            match self.collect().await {
                Ok(count) => {
                    self.events_collected += count as u64;
                    info!(
                        kind = kind.as_str(),
                        count,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Collected events"
                    );
                }
                Err(err) => {
                    self.state = CollectorState::Scheduled;
                    error!(kind = kind.as_str(), error = %err, "Event collection failed");
                }
            }
        }
        info!(kind = kind.as_str(), "Event collector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use paasbill_common::BillingError;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct MemoryStore {
        events: Mutex<Vec<RawEvent>>,
    }

    #[async_trait]
    impl RawEventStore for MemoryStore {
        async fn store_events(&self, events: &[RawEvent]) -> Result<u64> {
            let mut stored = self.events.lock();
            let mut inserted = 0;
            for event in events {
                if !stored.iter().any(|e| e.guid == event.guid) {
                    stored.push(event.clone());
                    inserted += 1;
                }
            }
            Ok(inserted)
        }

        async fn get_events(&self, filter: &RawEventFilter) -> Result<Vec<RawEvent>> {
            let stored = self.events.lock();
            let limit = filter.effective_limit().unwrap_or(i64::MAX) as usize;
            Ok(stored.iter().rev().take(limit).cloned().collect())
        }
    }

    /// Serves a fixed list of events in pages of two
    struct PagedFetcher {
        events: Vec<RawEvent>,
        fail: bool,
    }

    #[async_trait]
    impl EventFetcher for PagedFetcher {
        fn kind(&self) -> EventKind {
            EventKind::App
        }

        async fn fetch_events(&self, last_event: Option<&RawEvent>) -> Result<Vec<RawEvent>> {
            if self.fail {
                return Err(BillingError::Upstream("api unavailable".to_string()));
            }
            let start = match last_event {
                Some(last) => self
                    .events
                    .iter()
                    .position(|e| e.guid == last.guid)
                    .map_or(0, |i| i + 1),
                None => 0,
            };
            Ok(self.events.iter().skip(start).take(2).cloned().collect())
        }
    }

    fn events(n: usize) -> Vec<RawEvent> {
        (0..n)
            .map(|i| {
                RawEvent::new(
                    format!("event-{i}"),
                    EventKind::App,
                    Utc::now() - ChronoDuration::hours(1) + ChronoDuration::seconds(i as i64),
                    json!({"state": "STARTED"}),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_collects_until_caught_up() {
        let store = Arc::new(MemoryStore::default());
        let fetcher = Arc::new(PagedFetcher { events: events(3), fail: false });
        let mut collector = EventCollector::new(CollectorConfig::default(), fetcher, store.clone());
        assert_eq!(collector.wait_duration(), Duration::ZERO);

        assert_eq!(collector.collect().await.unwrap(), 2);
        assert_eq!(collector.state(), CollectorState::Collecting);
        assert_eq!(collector.wait_duration(), Duration::from_secs(3));

        assert_eq!(collector.collect().await.unwrap(), 1);
        assert_eq!(collector.state(), CollectorState::Collecting);

        assert_eq!(collector.collect().await.unwrap(), 0);
        assert_eq!(collector.state(), CollectorState::Scheduled);
        assert_eq!(collector.wait_duration(), Duration::from_secs(15 * 60));
        assert_eq!(store.events.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_run_survives_errors_and_stops_on_cancel() {
        let store = Arc::new(MemoryStore::default());
        let fetcher = Arc::new(PagedFetcher { events: events(1), fail: true });
        let collector = EventCollector::new(CollectorConfig::default(), fetcher, store.clone());
        let token = CancellationToken::new();
        let handle = tokio::spawn(collector.run(token.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(store.events.lock().is_empty());
    }
}
