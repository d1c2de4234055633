//! Raw, usage and billable event shapes

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::range::{self, TimeRange};
use super::reference::{CurrencyCode, VatCode};
use crate::error::{Result, ValidationError};

/// Source of a raw event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    App,
    Service,
    Compose,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::App, EventKind::Service, EventKind::Compose];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::App => "app",
            EventKind::Service => "service",
            EventKind::Compose => "compose",
        }
    }

    /// Tie-break order for events sharing a timestamp
    pub fn rank(&self) -> u8 {
        match self {
            EventKind::App => 0,
            EventKind::Service => 1,
            EventKind::Compose => 2,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "app" => Ok(EventKind::App),
            "service" => Ok(EventKind::Service),
            "compose" => Ok(EventKind::Compose),
            other => Err(ValidationError::InvalidField {
                field: "kind".to_string(),
                reason: format!("unknown event kind '{other}'"),
            }),
        }
    }
}

/// Lifecycle event as received from the platform, stored verbatim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub guid: String,
    pub kind: EventKind,
    pub raw_message: serde_json::Value,
    #[serde(with = "range::instant_format")]
    pub created_at: DateTime<Utc>,
}

impl RawEvent {
    pub fn new(
        guid: impl Into<String>,
        kind: EventKind,
        created_at: DateTime<Utc>,
        raw_message: serde_json::Value,
    ) -> Self {
        Self {
            guid: guid.into(),
            kind,
            raw_message,
            created_at,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.guid.trim().is_empty() {
            return Err(ValidationError::InvalidEvent("events must have a GUID".to_string()).into());
        }
        if self.created_at == range::epoch() {
            return Err(
                ValidationError::InvalidEvent("events must have a CreatedAt time".to_string()).into(),
            );
        }
        let empty = match &self.raw_message {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            serde_json::Value::String(s) => s.is_empty(),
            _ => false,
        };
        if empty {
            return Err(ValidationError::InvalidEvent(
                "events must have a RawMessage payload".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

/// Resource usage interval, clipped to the requested window when read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub event_guid: Uuid,
    #[serde(with = "range::instant_format")]
    pub event_start: DateTime<Utc>,
    #[serde(with = "range::instant_format")]
    pub event_stop: DateTime<Utc>,
    pub resource_guid: Uuid,
    pub resource_name: String,
    pub resource_type: String,
    pub org_guid: Uuid,
    pub space_guid: Uuid,
    pub plan_guid: Uuid,
    #[serde(default)]
    pub plan_name: String,
    #[serde(default)]
    pub service_guid: Option<Uuid>,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub number_of_nodes: i64,
    #[serde(default)]
    pub memory_in_mb: i64,
    #[serde(default)]
    pub storage_in_mb: i64,
}

impl UsageEvent {
    pub fn duration(&self) -> TimeRange {
        TimeRange::new(self.event_start, self.event_stop)
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_stop < self.event_start {
            return Err(ValidationError::InvalidEvent(format!(
                "event {} stops before it starts",
                self.event_guid
            ))
            .into());
        }
        if self.number_of_nodes < 0 || self.memory_in_mb < 0 || self.storage_in_mb < 0 {
            return Err(ValidationError::InvalidEvent(format!(
                "event {} has negative sizing",
                self.event_guid
            ))
            .into());
        }
        if self.resource_type.is_empty() {
            return Err(ValidationError::InvalidEvent(format!(
                "event {} has no resource_type",
                self.event_guid
            ))
            .into());
        }
        Ok(())
    }
}

/// One priced slice of a billable event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceComponent {
    pub name: String,
    pub plan_name: String,
    #[serde(with = "range::instant_format")]
    pub start: DateTime<Utc>,
    #[serde(with = "range::instant_format")]
    pub stop: DateTime<Utc>,
    pub vat_rate: Decimal,
    pub vat_code: VatCode,
    /// Currency the price is reported in; always GBP after conversion
    pub currency_code: CurrencyCode,
    /// Conversion rate applied from the component's source currency
    pub currency_rate: Decimal,
    pub ex_vat: Decimal,
    pub inc_vat: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Price {
    pub ex_vat: Decimal,
    pub inc_vat: Decimal,
    pub details: Vec<PriceComponent>,
}

impl Price {
    /// Sums the slices exactly; totals are normalised for rendering
    pub fn from_details(details: Vec<PriceComponent>) -> Self {
        let ex_vat: Decimal = details.iter().map(|d| d.ex_vat).sum();
        let inc_vat: Decimal = details.iter().map(|d| d.inc_vat).sum();
        Self {
            ex_vat: ex_vat.normalize(),
            inc_vat: inc_vat.normalize(),
            details,
        }
    }
}

/// Priced aggregation of one usage interval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillableEvent {
    pub event_guid: Uuid,
    #[serde(with = "range::instant_format")]
    pub event_start: DateTime<Utc>,
    #[serde(with = "range::instant_format")]
    pub event_stop: DateTime<Utc>,
    pub resource_guid: Uuid,
    pub resource_name: String,
    pub resource_type: String,
    pub org_guid: Uuid,
    pub org_name: String,
    pub space_guid: Uuid,
    pub space_name: String,
    pub plan_guid: Uuid,
    pub plan_name: String,
    pub number_of_nodes: i64,
    pub memory_in_mb: i64,
    pub storage_in_mb: i64,
    pub price: Price,
}

/// Accumulated cost per plan across all recorded usage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalCost {
    pub plan_guid: Uuid,
    pub cost: Decimal,
}
