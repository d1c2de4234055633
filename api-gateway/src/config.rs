//! Process configuration read from the environment

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use paasbill_common::types::range::parse_instant;
use paasbill_eventstore::collector::{CfFetcherConfig, CollectorConfig};
use paasbill_eventstore::{EngineConfig, ProcessorConfig};
use serde::Deserialize;

/// Raw environment values, keys lowercased by the `config` crate
#[derive(Debug, Default, Deserialize)]
struct EnvSettings {
    database_url: Option<String>,
    port: Option<String>,
    billing_config: Option<String>,
    db_max_connections: Option<String>,
    db_max_idle_time: Option<String>,
    db_max_lifetime: Option<String>,
    collector_schedule: Option<String>,
    collector_min_wait_time: Option<String>,
    cf_record_min_age: Option<String>,
    cf_fetch_limit: Option<String>,
    cf_api_address: Option<String>,
    cf_token_url: Option<String>,
    cf_client_id: Option<String>,
    cf_client_secret: Option<String>,
    processor_schedule: Option<String>,
    consolidation_start_date: Option<String>,
    consolidation_end_date: Option<String>,
}

/// Cloud Foundry endpoints and client credentials shared by the fetchers and
/// the token verifier
#[derive(Debug, Clone)]
pub struct CfSettings {
    pub api_address: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// JSON reference data; an empty reference is used when unset
    pub billing_config: Option<PathBuf>,
    pub engine: EngineConfig,
    pub processor: ProcessorConfig,
    pub collector: CollectorConfig,
    /// Fetcher settings without credentials
    pub fetcher: CfFetcherConfig,
    /// `None` disables the collectors and token verification
    pub cf: Option<CfSettings>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8881,
            billing_config: None,
            engine: EngineConfig::default(),
            processor: ProcessorConfig::default(),
            collector: CollectorConfig::default(),
            fetcher: CfFetcherConfig::default(),
            cf: None,
        }
    }
}

fn duration(name: &str, value: Option<String>, default: Duration) -> Result<Duration> {
    match value.filter(|v| !v.trim().is_empty()) {
        Some(v) => humantime::parse_duration(v.trim())
            .with_context(|| format!("{} is not a valid duration: '{v}'", name.to_uppercase())),
        None => Ok(default),
    }
}

fn number<T: std::str::FromStr>(name: &str, value: Option<String>, default: T) -> Result<T> {
    match value.filter(|v| !v.trim().is_empty()) {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| anyhow!("{} is not a valid number: '{v}'", name.to_uppercase())),
        None => Ok(default),
    }
}

fn date(name: &str, value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    match value.filter(|v| !v.trim().is_empty()) {
        Some(v) => parse_instant(&v)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be YYYY-MM-DD or RFC 3339, got '{v}'", name.to_uppercase())),
        None => Ok(None),
    }
}

impl AppConfig {
    /// Loads `.env` if present, then reads the process environment
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::load(None)
    }

    /// Reads configuration from the given variables instead of the process
    /// environment
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self> {
        Self::load(Some(vars))
    }

    fn load(vars: Option<HashMap<String, String>>) -> Result<Self> {
        let settings: EnvSettings = config::Config::builder()
            .add_source(config::Environment::default().source(vars))
            .build()
            .context("failed to read environment")?
            .try_deserialize()
            .context("failed to read environment")?;

        let defaults = Self::default();
        let mut engine = defaults.engine;
        if let Some(url) = settings.database_url.filter(|v| !v.is_empty()) {
            engine.database_url = url;
        }
        engine.max_connections = number("db_max_connections", settings.db_max_connections, engine.max_connections)?;
        engine.idle_timeout = duration("db_max_idle_time", settings.db_max_idle_time, engine.idle_timeout)?;
        engine.max_lifetime = duration("db_max_lifetime", settings.db_max_lifetime, engine.max_lifetime)?;
        if let Some(start) = date("consolidation_start_date", settings.consolidation_start_date)? {
            engine.consolidation_start = start;
        }
        engine.consolidation_end = date("consolidation_end_date", settings.consolidation_end_date)?;

        let processor = ProcessorConfig {
            schedule: duration("processor_schedule", settings.processor_schedule, defaults.processor.schedule)?,
            ..defaults.processor
        };
        let collector = CollectorConfig {
            schedule: duration("collector_schedule", settings.collector_schedule, defaults.collector.schedule)?,
            min_wait_time: duration(
                "collector_min_wait_time",
                settings.collector_min_wait_time,
                defaults.collector.min_wait_time,
            )?,
            ..defaults.collector
        };

        let cf = match (settings.cf_api_address, settings.cf_token_url) {
            (Some(api_address), Some(token_url)) if !api_address.is_empty() && !token_url.is_empty() => {
                Some(CfSettings {
                    api_address,
                    token_url,
                    client_id: settings.cf_client_id.unwrap_or_default(),
                    client_secret: settings.cf_client_secret.unwrap_or_default(),
                })
            }
            _ => None,
        };
        let fetcher = CfFetcherConfig {
            record_min_age: duration("cf_record_min_age", settings.cf_record_min_age, defaults.fetcher.record_min_age)?,
            fetch_limit: number("cf_fetch_limit", settings.cf_fetch_limit, defaults.fetcher.fetch_limit)?,
            ..defaults.fetcher
        };
        fetcher.validate()?;

        Ok(Self {
            port: number("port", settings.port, defaults.port)?,
            billing_config: settings.billing_config.filter(|v| !v.is_empty()).map(PathBuf::from),
            engine,
            processor,
            collector,
            fetcher,
            cf,
        })
    }

    /// Fetcher settings with the Cloud Foundry credentials filled in
    pub fn fetcher_config(&self, cf: &CfSettings) -> CfFetcherConfig {
        CfFetcherConfig {
            api_address: cf.api_address.clone(),
            token_url: cf.token_url.clone(),
            client_id: cf.client_id.clone(),
            client_secret: cf.client_secret.clone(),
            ..self.fetcher.clone()
        }
    }
}
