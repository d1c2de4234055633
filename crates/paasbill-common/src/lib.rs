//! # PaaS Billing Common
//!
//! Shared domain types and errors for the PaaS billing engine.
//!
//! ## Core Types
//!
//! - [`TimeRange`]: half-open `[lo, hi)` range over UTC instants
//! - [`EventFilter`]: time window plus organisation filter for event reads
//! - [`RawEvent`]: platform lifecycle event stored verbatim
//! - [`UsageEvent`]: resource usage interval
//! - [`BillableEvent`]/[`Price`]: priced usage interval with per-slice detail
//! - [`Config`]: versioned pricing plans, VAT rates and currency rates
//!
//! ## Errors
//!
//! - [`BillingError`]: unified error type, with [`ValidationError`],
//!   [`ReferenceError`] and [`FormulaError`] for the domain failures

pub mod error;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{BillingError, FormulaError, ReferenceError, Result, ValidationError};
pub use types::{
    events::{BillableEvent, EventKind, Price, PriceComponent, RawEvent, TotalCost, UsageEvent},
    filter::{EventFilter, RangeFilter, RawEventFilter},
    range::TimeRange,
    reference::{
        Config, CurrencyCode, CurrencyRate, PricingPlan, PricingPlanComponent, VatCode, VatRate,
        Versioned,
    },
};

use std::time::Duration;

use rust_decimal::Decimal;
use uuid::Uuid;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Organisation every forecast input must belong to
pub const DUMMY_ORG_GUID: Uuid = Uuid::from_u128(0x00000001_0000_0000_0000_000000000000);

pub const DUMMY_ORG_NAME: &str = "my-org";

/// Space assigned to forecast inputs
pub const DUMMY_SPACE_GUID: Uuid = Uuid::from_u128(0x00000001_0001_0000_0000_000000000000);

pub const DUMMY_SPACE_NAME: &str = "my-space";

/// Plan name reported for forecast inputs
pub const FORECAST_PLAN_NAME: &str = "simulated";

/// Default compute plan for app instances
pub const DEFAULT_COMPUTE_PLAN_GUID: Uuid = Uuid::from_u128(0xf4d4b95a_f55e_4593_8d54_3364c25798c4);

/// Default plan for one-off tasks
pub const DEFAULT_TASK_PLAN_GUID: Uuid = Uuid::from_u128(0xebfa9453_ef66_450c_8c37_d53dfd931038);

/// Default plan for staging (buildpack) runs
pub const DEFAULT_STAGING_PLAN_GUID: Uuid = Uuid::from_u128(0x9d071c77_7a68_4346_9981_e8dafac95b6f);

/// Service GUID reported for compute resources
pub const COMPUTE_SERVICE_GUID: Uuid = Uuid::from_u128(0x4f6f0a18_cdd4_4e51_8b6b_dc39b696e61b);

/// Minimum charge per priced slice, in GBP ex VAT
pub const MIN_CHARGE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Fractional digits kept when rounding a formula result
pub const FORMULA_SCALE: u32 = 16;

/// First month considered by the consolidation backfill
pub const DEFAULT_CONSOLIDATION_START_DATE: &str = "2017-07-01";

/// Months newer than this are left live by the consolidation backfill
pub const CONSOLIDATION_LAG_DAYS: i64 = 5;

pub const INIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub const STORE_TIMEOUT: Duration = Duration::from_secs(45);

pub const QUERY_TIMEOUT: Duration = Duration::from_secs(45);
