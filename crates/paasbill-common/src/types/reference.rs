//! Versioned reference data: pricing plans, VAT rates and currency rates
//!
//! Each table is keyed by `(key, valid_from)`. A version is valid from its
//! `valid_from` until the next `valid_from` of the same key, or forever when
//! it is the newest.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::range::{self, TimeRange};
use crate::error::{BillingError, ReferenceError, Result};

/// VAT category of a pricing component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VatCode {
    Standard,
    Reduced,
    Zero,
}

impl VatCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VatCode::Standard => "Standard",
            VatCode::Reduced => "Reduced",
            VatCode::Zero => "Zero",
        }
    }
}

impl fmt::Display for VatCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VatCode {
    type Err = ReferenceError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Standard" => Ok(VatCode::Standard),
            "Reduced" => Ok(VatCode::Reduced),
            "Zero" => Ok(VatCode::Zero),
            other => Err(ReferenceError::InvalidReference {
                field: "vat_code".to_string(),
                reason: format!("unknown vat code '{other}'"),
            }),
        }
    }
}

/// Source currency of a pricing component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CurrencyCode {
    Gbp,
    Usd,
    Eur,
}

impl CurrencyCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CurrencyCode::Gbp => "GBP",
            CurrencyCode::Usd => "USD",
            CurrencyCode::Eur => "EUR",
        }
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CurrencyCode {
    type Err = ReferenceError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "GBP" => Ok(CurrencyCode::Gbp),
            "USD" => Ok(CurrencyCode::Usd),
            "EUR" => Ok(CurrencyCode::Eur),
            other => Err(ReferenceError::InvalidReference {
                field: "currency_code".to_string(),
                reason: format!("unknown currency code '{other}'"),
            }),
        }
    }
}

/// One additive line of a plan version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingPlanComponent {
    pub name: String,
    pub formula: String,
    pub vat_code: VatCode,
    pub currency_code: CurrencyCode,
}

/// A plan version. Sizing fields are the defaults used for events that do
/// not carry their own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingPlan {
    pub plan_guid: Uuid,
    #[serde(with = "range::instant_format")]
    pub valid_from: DateTime<Utc>,
    pub name: String,
    #[serde(default)]
    pub memory_in_mb: i64,
    #[serde(default)]
    pub storage_in_mb: i64,
    #[serde(default)]
    pub number_of_nodes: i64,
    #[serde(default)]
    pub components: Vec<PricingPlanComponent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatRate {
    pub code: VatCode,
    #[serde(with = "range::instant_format")]
    pub valid_from: DateTime<Utc>,
    #[serde(with = "decimal_format")]
    pub rate: Decimal,
}

/// Conversion rate from `code` to GBP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyRate {
    pub code: CurrencyCode,
    #[serde(with = "range::instant_format")]
    pub valid_from: DateTime<Utc>,
    #[serde(with = "decimal_format")]
    pub rate: Decimal,
}

/// Reference configuration applied on every refresh
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub vat_rates: Vec<VatRate>,
    #[serde(default)]
    pub currency_rates: Vec<CurrencyRate>,
    #[serde(default)]
    pub pricing_plans: Vec<PricingPlan>,
    /// Generate zero-cost placeholder plans for plan GUIDs with no configuration
    #[serde(default)]
    pub ignore_missing_plans: bool,
}

impl Config {
    /// Reads a JSON configuration document
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BillingError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| BillingError::Config(e.to_string()))
    }

    pub fn add_plan(&mut self, plan: PricingPlan) {
        self.pricing_plans.push(plan);
    }

    pub fn add_vat_rate(&mut self, rate: VatRate) {
        self.vat_rates.push(rate);
    }

    pub fn add_currency_rate(&mut self, rate: CurrencyRate) {
        self.currency_rates.push(rate);
    }
}

/// A value tagged with its half-open validity window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub valid_for: TimeRange,
    pub value: T,
}

/// Attaches validity windows to versions of the same key: each version lasts
/// until the next `valid_from`, the newest is unbounded. Input order does not
/// matter; output is ordered by `valid_from`.
pub fn with_validity<T, F>(mut versions: Vec<T>, valid_from: F) -> Vec<Versioned<T>>
where
    F: Fn(&T) -> DateTime<Utc>,
{
    versions.sort_by_key(|v| valid_from(v));
    let starts: Vec<DateTime<Utc>> = versions.iter().map(&valid_from).collect();
    versions
        .into_iter()
        .enumerate()
        .map(|(i, value)| Versioned {
            valid_for: TimeRange {
                lo: starts[i],
                hi: starts.get(i + 1).copied(),
            },
            value,
        })
        .collect()
}

/// Decimal fields accept either a JSON string or a JSON number and are written
/// back as strings
pub mod decimal_format {
    use rust_decimal::Decimal;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.normalize().to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::String(s) => s,
            serde_json::Value::Number(n) => n.to_string(),
            other => {
                return Err(serde::de::Error::custom(format!("expected a decimal, got {other}")))
            }
        };
        Decimal::from_str(&text)
            .or_else(|_| Decimal::from_scientific(&text))
            .map_err(|e| serde::de::Error::custom(format!("invalid decimal '{text}': {e}")))
    }
}
