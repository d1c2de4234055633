//! Cloud Foundry usage event fetcher
//!
//! Reads `/v2/app_usage_events` or `/v2/service_usage_events` page by page.
//! Events younger than the configured minimum age are held back so that late
//! arriving events with earlier timestamps are not skipped.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use paasbill_common::{BillingError, EventKind, RawEvent, Result};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::EventFetcher;

const MIN_RECORD_AGE: Duration = Duration::from_secs(5 * 60);
const MAX_FETCH_LIMIT: u32 = 100;

/// Connection and paging settings for [`CfUsageEventFetcher`]
#[derive(Debug, Clone)]
pub struct CfFetcherConfig {
    /// Cloud Foundry API base URL
    pub api_address: String,
    /// UAA base URL issuing client credential tokens
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Events younger than this are not fetched yet
    pub record_min_age: Duration,
    /// Page size, between 1 and 100
    pub fetch_limit: u32,
}

impl Default for CfFetcherConfig {
    fn default() -> Self {
        Self {
            api_address: String::new(),
            token_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            record_min_age: Duration::from_secs(10 * 60),
            fetch_limit: 50,
        }
    }
}

impl CfFetcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fetch_limit == 0 || self.fetch_limit > MAX_FETCH_LIMIT {
            return Err(BillingError::Config(
                "CF_FETCH_LIMIT must be between 1 and 100".to_string(),
            ));
        }
        if self.record_min_age < MIN_RECORD_AGE {
            return Err(BillingError::Config(
                "CF_RECORD_MIN_AGE should be at least 5m to reduce the risk of late arriving events being skipped"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct UsageEventList {
    #[serde(default)]
    resources: Vec<UsageEventResource>,
}

#[derive(Debug, Deserialize)]
struct UsageEventResource {
    metadata: UsageEventMetadata,
    entity: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct UsageEventMetadata {
    guid: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Fetches app or service usage events from the Cloud Foundry v2 API
pub struct CfUsageEventFetcher {
    kind: EventKind,
    config: CfFetcherConfig,
    client: reqwest::Client,
    token: RwLock<Option<CachedToken>>,
}

fn upstream(context: &str, err: reqwest::Error) -> BillingError {
    BillingError::Upstream(format!("{context}: {err}"))
}

/// Drops every event from the first one created after `cutoff`
fn mature_events(resources: Vec<UsageEventResource>, kind: EventKind, cutoff: DateTime<Utc>) -> Vec<RawEvent> {
    resources
        .into_iter()
        .take_while(|r| r.metadata.created_at <= cutoff)
        .map(|r| RawEvent::new(r.metadata.guid, kind, r.metadata.created_at, r.entity))
        .collect()
}

impl CfUsageEventFetcher {
    /// `kind` must be [`EventKind::App`] or [`EventKind::Service`]
    pub fn new(kind: EventKind, config: CfFetcherConfig) -> Result<Self> {
        if kind == EventKind::Compose {
            return Err(BillingError::Config(
                "the Cloud Foundry fetcher only serves app and service events".to_string(),
            ));
        }
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| upstream("failed to build HTTP client", e))?;
        Ok(Self {
            kind,
            config,
            client,
            token: RwLock::new(None),
        })
    }

    fn path(&self) -> String {
        format!(
            "{}/v2/{}_usage_events",
            self.config.api_address.trim_end_matches('/'),
            self.kind.as_str()
        )
    }

    async fn access_token(&self) -> Result<String> {
        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref().filter(|t| t.expires_at > Instant::now()) {
                return Ok(token.value.clone());
            }
        }

        let url = format!("{}/oauth/token", self.config.token_url.trim_end_matches('/'));
        let response: TokenResponse = self
            .client
            .post(&url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| upstream("token request failed", e))?
            .json()
            .await
            .map_err(|e| upstream("invalid token response", e))?;

        // refresh a minute early
        let lifetime = Duration::from_secs(response.expires_in.saturating_sub(60));
        let value = response.access_token;
        *self.token.write().await = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(value)
    }
}

#[async_trait]
impl EventFetcher for CfUsageEventFetcher {
    fn kind(&self) -> EventKind {
        self.kind
    }

    async fn fetch_events(&self, last_event: Option<&RawEvent>) -> Result<Vec<RawEvent>> {
        let mut query = vec![("results-per-page", self.config.fetch_limit.to_string())];
        if let Some(last) = last_event {
            if last.guid.is_empty() {
                return Err(BillingError::Internal("invalid GUID for last event".to_string()));
            }
            query.push(("after_guid", last.guid.clone()));
        }

        let path = self.path();
        debug!(path = %path, after_guid = ?last_event.map(|e| e.guid.as_str()), "Fetching usage events");
        let started = Instant::now();
        let token = self.access_token().await?;
        let list: UsageEventList = self
            .client
            .get(&path)
            .bearer_auth(token)
            .query(&query)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| upstream(&format!("{path} request failed"), e))?
            .json()
            .await
            .map_err(|e| upstream(&format!("invalid {path} response"), e))?;

        let cutoff = Utc::now() - chrono::Duration::from_std(self.config.record_min_age).unwrap_or_default();
        let events = mature_events(list.resources, self.kind, cutoff);
        info!(
            kind = self.kind.as_str(),
            count = events.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fetched usage events"
        );
        Ok(events)
    }
}
