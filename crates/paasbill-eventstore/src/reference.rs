//! Reference store
//!
//! Pricing plans, VAT rates and currency rates are replaced from
//! configuration on every refresh. Versions of the same key are valid from
//! their `valid_from` until the next one.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use paasbill_common::types::range::{self, format_instant, is_day_start, is_month_start};
use paasbill_common::types::reference::with_validity;
use paasbill_common::{
    BillingError, Config, CurrencyCode, CurrencyRate, PricingPlan, PricingPlanComponent,
    RangeFilter, ReferenceError, Result, TimeRange, VatCode, VatRate, Versioned,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::SqliteConnection;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::db::{self, get_decimal, get_i64, get_instant, get_string, get_uuid, storage_error};
use crate::metrics::StoreMetrics;
use crate::pricing::formula::Formula;

/// Name of the single component of a generated placeholder plan
pub const PLACEHOLDER_COMPONENT: &str = "pending";

/// Reference data indexed by key, each key's versions ordered and tagged with
/// their validity
#[derive(Debug, Clone, Default)]
pub struct ReferenceData {
    pub plans: HashMap<Uuid, Vec<Versioned<PricingPlan>>>,
    pub vat_rates: HashMap<VatCode, Vec<Versioned<Decimal>>>,
    pub currency_rates: HashMap<CurrencyCode, Vec<Versioned<Decimal>>>,
}

impl ReferenceData {
    pub fn from_config(config: &Config) -> Self {
        let mut plans: HashMap<Uuid, Vec<PricingPlan>> = HashMap::new();
        for plan in &config.pricing_plans {
            plans.entry(plan.plan_guid).or_default().push(plan.clone());
        }
        let mut vat_rates: HashMap<VatCode, Vec<(DateTime<Utc>, Decimal)>> = HashMap::new();
        for rate in &config.vat_rates {
            vat_rates.entry(rate.code).or_default().push((rate.valid_from, rate.rate));
        }
        let mut currency_rates: HashMap<CurrencyCode, Vec<(DateTime<Utc>, Decimal)>> =
            HashMap::new();
        for rate in &config.currency_rates {
            currency_rates
                .entry(rate.code)
                .or_default()
                .push((rate.valid_from, rate.rate));
        }

        Self {
            plans: plans
                .into_iter()
                .map(|(guid, versions)| (guid, with_validity(versions, |p| p.valid_from)))
                .collect(),
            vat_rates: vat_rates
                .into_iter()
                .map(|(code, versions)| (code, rate_versions(versions)))
                .collect(),
            currency_rates: currency_rates
                .into_iter()
                .map(|(code, versions)| (code, rate_versions(versions)))
                .collect(),
        }
    }

    /// Reads the reference tables
    pub async fn load(conn: &mut SqliteConnection) -> Result<Self> {
        Ok(Self::from_config(&read_config(conn).await?))
    }

    pub fn plan_versions(&self, plan_guid: &Uuid) -> &[Versioned<PricingPlan>] {
        self.plans.get(plan_guid).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn vat_versions(&self, code: VatCode) -> &[Versioned<Decimal>] {
        self.vat_rates.get(&code).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn currency_versions(&self, code: CurrencyCode) -> &[Versioned<Decimal>] {
        self.currency_rates
            .get(&code)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Plan versions overlapping `range`, ordered by `valid_from` then GUID
    pub fn pricing_plans_in(&self, range: &TimeRange) -> Vec<PricingPlan> {
        let mut plans: Vec<PricingPlan> = self
            .plans
            .values()
            .flatten()
            .filter(|v| v.valid_for.overlaps(range))
            .map(|v| v.value.clone())
            .collect();
        plans.sort_by(|a, b| (a.valid_from, a.plan_guid).cmp(&(b.valid_from, b.plan_guid)));
        plans
    }

    pub fn vat_rates_in(&self, range: &TimeRange) -> Vec<VatRate> {
        let mut rates: Vec<VatRate> = self
            .vat_rates
            .iter()
            .flat_map(|(code, versions)| {
                versions
                    .iter()
                    .filter(|v| v.valid_for.overlaps(range))
                    .map(|v| VatRate {
                        code: *code,
                        valid_from: v.valid_for.lo,
                        rate: v.value,
                    })
            })
            .collect();
        rates.sort_by(|a, b| (a.valid_from, a.code).cmp(&(b.valid_from, b.code)));
        rates
    }

    pub fn currency_rates_in(&self, range: &TimeRange) -> Vec<CurrencyRate> {
        let mut rates: Vec<CurrencyRate> = self
            .currency_rates
            .iter()
            .flat_map(|(code, versions)| {
                versions
                    .iter()
                    .filter(|v| v.valid_for.overlaps(range))
                    .map(|v| CurrencyRate {
                        code: *code,
                        valid_from: v.valid_for.lo,
                        rate: v.value,
                    })
            })
            .collect();
        rates.sort_by(|a, b| (a.valid_from, a.code).cmp(&(b.valid_from, b.code)));
        rates
    }
}

fn rate_versions(versions: Vec<(DateTime<Utc>, Decimal)>) -> Vec<Versioned<Decimal>> {
    with_validity(versions, |(from, _)| *from)
        .into_iter()
        .map(|v| Versioned {
            valid_for: v.valid_for,
            value: v.value.1,
        })
        .collect()
}

fn valid_at<T>(versions: &[Versioned<T>], at: DateTime<Utc>) -> Option<&T> {
    versions
        .iter()
        .find(|v| v.valid_for.lo <= at && v.valid_for.hi.map_or(true, |hi| at < hi))
        .map(|v| &v.value)
}

fn invalid(field: &str, reason: String) -> BillingError {
    ReferenceError::InvalidReference {
        field: field.to_string(),
        reason,
    }
    .into()
}

/// Checks a configuration without touching storage
pub fn validate_config(config: &Config) -> Result<()> {
    let mut seen = HashSet::new();
    for rate in &config.vat_rates {
        if !is_month_start(rate.valid_from) {
            return Err(invalid(
                "vat_rates.valid_from",
                format!("'{}' rate for {} must start on the first of a month", rate.code, format_instant(&rate.valid_from)),
            ));
        }
        if rate.rate.is_sign_negative() {
            return Err(invalid("vat_rates.rate", format!("'{}' rate must not be negative", rate.code)));
        }
        if !seen.insert((rate.code.as_str(), rate.valid_from)) {
            return Err(invalid(
                "vat_rates",
                format!("duplicate '{}' rate valid from {}", rate.code, format_instant(&rate.valid_from)),
            ));
        }
    }

    let mut seen = HashSet::new();
    for rate in &config.currency_rates {
        if !is_day_start(rate.valid_from) {
            return Err(invalid(
                "currency_rates.valid_from",
                format!("'{}' rate for {} must start at midnight", rate.code, format_instant(&rate.valid_from)),
            ));
        }
        if rate.rate.is_sign_negative() || rate.rate.is_zero() {
            return Err(invalid("currency_rates.rate", format!("'{}' rate must be positive", rate.code)));
        }
        if rate.code == CurrencyCode::Gbp && rate.rate != Decimal::ONE {
            return Err(invalid("currency_rates.rate", "GBP rate must be 1".to_string()));
        }
        if !seen.insert((rate.code.as_str(), rate.valid_from)) {
            return Err(invalid(
                "currency_rates",
                format!("duplicate '{}' rate valid from {}", rate.code, format_instant(&rate.valid_from)),
            ));
        }
    }

    let mut seen = HashSet::new();
    for plan in &config.pricing_plans {
        validate_plan(plan)?;
        if !seen.insert((plan.plan_guid, plan.valid_from)) {
            return Err(invalid(
                "pricing_plans",
                format!("duplicate version of plan '{}' valid from {}", plan.plan_guid, format_instant(&plan.valid_from)),
            ));
        }
        for component in &plan.components {
            require_rates(config, plan, component)?;
        }
    }
    Ok(())
}

fn validate_plan(plan: &PricingPlan) -> Result<()> {
    if !is_month_start(plan.valid_from) {
        return Err(invalid(
            "pricing_plans.valid_from",
            format!("plan '{}' must start on the first of a month, got {}", plan.plan_guid, format_instant(&plan.valid_from)),
        ));
    }
    if plan.memory_in_mb < 0 || plan.storage_in_mb < 0 || plan.number_of_nodes < 0 {
        return Err(invalid(
            "pricing_plans",
            format!("plan '{}' has negative sizing", plan.plan_guid),
        ));
    }
    if plan.components.is_empty() {
        return Err(invalid(
            "pricing_plans.components",
            format!("plan '{}' needs at least one component", plan.plan_guid),
        ));
    }
    let mut names = HashSet::new();
    for component in &plan.components {
        if component.name.trim().is_empty() {
            return Err(invalid(
                "pricing_plans.components.name",
                format!("plan '{}' has an unnamed component", plan.plan_guid),
            ));
        }
        if !names.insert(component.name.as_str()) {
            return Err(invalid(
                "pricing_plans.components.name",
                format!("plan '{}' has duplicate component '{}'", plan.plan_guid, component.name),
            ));
        }
        Formula::parse(&component.formula)?;
    }
    Ok(())
}

/// A component needs a VAT rate and a currency rate in force when its plan
/// version starts
fn require_rates(config: &Config, plan: &PricingPlan, component: &PricingPlanComponent) -> Result<()> {
    let has_vat = config
        .vat_rates
        .iter()
        .any(|r| r.code == component.vat_code && r.valid_from <= plan.valid_from);
    if !has_vat {
        return Err(ReferenceError::MissingVatRate {
            code: component.vat_code.to_string(),
            valid_from: format_instant(&plan.valid_from),
            plan_guid: plan.plan_guid.to_string(),
        }
        .into());
    }
    let has_currency = config
        .currency_rates
        .iter()
        .any(|r| r.code == component.currency_code && r.valid_from <= plan.valid_from);
    if !has_currency {
        return Err(ReferenceError::MissingCurrencyRate {
            code: component.currency_code.to_string(),
            valid_from: format_instant(&plan.valid_from),
            plan_guid: plan.plan_guid.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Validates `config` and replaces the reference tables with it
#[instrument(skip_all, fields(plans = config.pricing_plans.len()))]
pub(crate) async fn apply_config(conn: &mut SqliteConnection, config: &Config) -> Result<()> {
    validate_config(config)?;

    for table in ["pricing_plan_components", "pricing_plans", "vat_rates", "currency_rates"] {
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&mut *conn)
            .await
            .map_err(storage_error)?;
    }

    for rate in &config.vat_rates {
        sqlx::query("INSERT INTO vat_rates (code, valid_from, rate) VALUES (?, ?, ?)")
            .bind(rate.code.as_str())
            .bind(db::micros(rate.valid_from))
            .bind(db::decimal_text(&rate.rate))
            .execute(&mut *conn)
            .await
            .map_err(storage_error)?;
    }
    for rate in &config.currency_rates {
        sqlx::query("INSERT INTO currency_rates (code, valid_from, rate) VALUES (?, ?, ?)")
            .bind(rate.code.as_str())
            .bind(db::micros(rate.valid_from))
            .bind(db::decimal_text(&rate.rate))
            .execute(&mut *conn)
            .await
            .map_err(storage_error)?;
    }
    for plan in &config.pricing_plans {
        insert_plan(conn, plan).await?;
    }

    debug!(
        vat_rates = config.vat_rates.len(),
        currency_rates = config.currency_rates.len(),
        "Applied reference configuration"
    );
    Ok(())
}

async fn insert_plan(conn: &mut SqliteConnection, plan: &PricingPlan) -> Result<()> {
    sqlx::query(
        "INSERT INTO pricing_plans (plan_guid, valid_from, name, memory_in_mb, storage_in_mb, number_of_nodes) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(db::guid_text(&plan.plan_guid))
    .bind(db::micros(plan.valid_from))
    .bind(&plan.name)
    .bind(plan.memory_in_mb)
    .bind(plan.storage_in_mb)
    .bind(plan.number_of_nodes)
    .execute(&mut *conn)
    .await
    .map_err(storage_error)?;

    for component in &plan.components {
        sqlx::query(
            "INSERT INTO pricing_plan_components (plan_guid, valid_from, name, formula, vat_code, currency_code) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(db::guid_text(&plan.plan_guid))
        .bind(db::micros(plan.valid_from))
        .bind(&component.name)
        .bind(&component.formula)
        .bind(component.vat_code.as_str())
        .bind(component.currency_code.as_str())
        .execute(&mut *conn)
        .await
        .map_err(storage_error)?;
    }
    Ok(())
}

/// Reads the reference tables back into a configuration document
pub(crate) async fn read_config(conn: &mut SqliteConnection) -> Result<Config> {
    let mut config = Config::default();

    let rows = sqlx::query("SELECT code, valid_from, rate FROM vat_rates ORDER BY valid_from, code")
        .fetch_all(&mut *conn)
        .await
        .map_err(storage_error)?;
    for row in &rows {
        config.add_vat_rate(VatRate {
            code: get_string(row, "code")?.parse()?,
            valid_from: get_instant(row, "valid_from")?,
            rate: get_decimal(row, "rate")?,
        });
    }

    let rows =
        sqlx::query("SELECT code, valid_from, rate FROM currency_rates ORDER BY valid_from, code")
            .fetch_all(&mut *conn)
            .await
            .map_err(storage_error)?;
    for row in &rows {
        config.add_currency_rate(CurrencyRate {
            code: get_string(row, "code")?.parse()?,
            valid_from: get_instant(row, "valid_from")?,
            rate: get_decimal(row, "rate")?,
        });
    }

    let rows = sqlx::query(
        "SELECT plan_guid, valid_from, name, formula, vat_code, currency_code \
         FROM pricing_plan_components ORDER BY plan_guid, valid_from, rowid",
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(storage_error)?;
    let mut components: BTreeMap<(Uuid, i64), Vec<PricingPlanComponent>> = BTreeMap::new();
    for row in &rows {
        components
            .entry((get_uuid(row, "plan_guid")?, get_i64(row, "valid_from")?))
            .or_default()
            .push(PricingPlanComponent {
                name: get_string(row, "name")?,
                formula: get_string(row, "formula")?,
                vat_code: get_string(row, "vat_code")?.parse()?,
                currency_code: get_string(row, "currency_code")?.parse()?,
            });
    }

    let rows = sqlx::query(
        "SELECT plan_guid, valid_from, name, memory_in_mb, storage_in_mb, number_of_nodes \
         FROM pricing_plans ORDER BY valid_from, plan_guid",
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(storage_error)?;
    for row in &rows {
        let plan_guid = get_uuid(row, "plan_guid")?;
        let key = (plan_guid, get_i64(row, "valid_from")?);
        config.add_plan(PricingPlan {
            plan_guid,
            valid_from: get_instant(row, "valid_from")?,
            name: get_string(row, "name")?,
            memory_in_mb: get_i64(row, "memory_in_mb")?,
            storage_in_mb: get_i64(row, "storage_in_mb")?,
            number_of_nodes: get_i64(row, "number_of_nodes")?,
            components: components.remove(&key).unwrap_or_default(),
        });
    }
    Ok(config)
}

/// Plans versions overlapping the filter range
pub(crate) async fn get_pricing_plans(
    conn: &mut SqliteConnection,
    filter: &RangeFilter,
) -> Result<Vec<PricingPlan>> {
    Ok(ReferenceData::load(conn).await?.pricing_plans_in(&filter.time_range()))
}

pub(crate) async fn get_vat_rates(
    conn: &mut SqliteConnection,
    filter: &RangeFilter,
) -> Result<Vec<VatRate>> {
    Ok(ReferenceData::load(conn).await?.vat_rates_in(&filter.time_range()))
}

pub(crate) async fn get_currency_rates(
    conn: &mut SqliteConnection,
    filter: &RangeFilter,
) -> Result<Vec<CurrencyRate>> {
    Ok(ReferenceData::load(conn).await?.currency_rates_in(&filter.time_range()))
}

const UNCONFIGURED_PLANS_SQL: &str = r#"
    SELECT e.plan_guid, e.plan_name, e.resource_type
    FROM events e
    WHERE NOT EXISTS (SELECT 1 FROM pricing_plans p WHERE p.plan_guid = e.plan_guid)
    ORDER BY e.plan_guid, e.duration_lo DESC
"#;

/// Placeholder plan for a plan GUID that has no configured version
pub fn placeholder_plan(plan_guid: Uuid, name: String) -> PricingPlan {
    PricingPlan {
        plan_guid,
        valid_from: range::epoch(),
        name,
        memory_in_mb: 0,
        storage_in_mb: 0,
        number_of_nodes: 0,
        components: vec![PricingPlanComponent {
            name: PLACEHOLDER_COMPONENT.to_string(),
            formula: "0".to_string(),
            vat_code: VatCode::Standard,
            currency_code: CurrencyCode::Gbp,
        }],
    }
}

/// Inserts a placeholder plan for every plan GUID referenced by `events` that
/// has no configured version. Returns how many were created.
pub(crate) async fn generate_missing_plans(
    conn: &mut SqliteConnection,
    metrics: &StoreMetrics,
) -> Result<usize> {
    let rows = sqlx::query(UNCONFIGURED_PLANS_SQL)
        .fetch_all(&mut *conn)
        .await
        .map_err(storage_error)?;

    let mut created = HashSet::new();
    for row in &rows {
        let plan_guid = get_uuid(row, "plan_guid")?;
        // rows are newest first per plan, so the first one names the plan
        if !created.insert(plan_guid) {
            continue;
        }
        let name = format!(
            "{} {}",
            get_string(row, "resource_type")?,
            get_string(row, "plan_name")?
        );
        warn!(plan_guid = %plan_guid, name = %name, "Generating placeholder pricing plan");
        insert_plan(conn, &placeholder_plan(plan_guid, name.clone())).await?;
        metrics
            .dummy_plans_created
            .with_label_values(&[plan_guid.to_string().as_str(), name.as_str()])
            .inc();
    }
    Ok(created.len())
}

const UNCOVERED_EVENT_SQL: &str = r#"
    WITH valid_pricing_plans AS (
        SELECT plan_guid, valid_from AS valid_lo,
               LEAD(valid_from) OVER (PARTITION BY plan_guid ORDER BY valid_from) AS valid_hi
        FROM pricing_plans
    )
    SELECT e.plan_guid, e.plan_name, e.resource_type
    FROM events e
    WHERE NOT EXISTS (
        SELECT 1 FROM valid_pricing_plans vpp
        WHERE vpp.plan_guid = e.plan_guid
          AND (e.duration_hi IS NULL OR e.duration_hi > vpp.valid_lo)
          AND (vpp.valid_hi IS NULL OR vpp.valid_hi > e.duration_lo)
    )
    ORDER BY e.duration_lo
    LIMIT 1
"#;

/// Fails when any interval does not overlap a version of its plan
pub(crate) async fn check_plan_consistency(
    conn: &mut SqliteConnection,
    metrics: &StoreMetrics,
) -> Result<()> {
    let row = sqlx::query(UNCOVERED_EVENT_SQL)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_error)?;
    let Some(row) = row else {
        return Ok(());
    };
    metrics.inconsistent_plans.inc();
    Err(ReferenceError::MissingPlan {
        plan_guid: get_string(&row, "plan_guid")?,
        plan_name: get_string(&row, "plan_name")?,
        resource_type: get_string(&row, "resource_type")?,
    }
    .into())
}

/// Publishes the rates in force at `now`
pub fn set_gauges(metrics: &StoreMetrics, reference: &ReferenceData, now: DateTime<Utc>) {
    for (code, versions) in &reference.vat_rates {
        if let Some(rate) = valid_at(versions, now).and_then(|r| r.to_f64()) {
            metrics.vat_gauge(code.as_str()).set(rate);
        }
    }
    for (code, versions) in &reference.currency_rates {
        if let Some(rate) = valid_at(versions, now).and_then(|r| r.to_f64()) {
            metrics.currency_gauge(code.as_str()).set(rate);
        }
    }
    info!(
        vat_codes = reference.vat_rates.len(),
        currencies = reference.currency_rates.len(),
        "Updated configured rate gauges"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;
    use paasbill_common::types::range::parse_instant;
    use rust_decimal_macros::dec;
    use sqlx::Connection;

    const PLAN: &str = "f4d4b95a-f55e-4593-8d54-3364c25798c4";

    fn at(s: &str) -> DateTime<Utc> {
        parse_instant(s).unwrap()
    }

    fn plan(valid_from: &str, formula: &str) -> PricingPlan {
        PricingPlan {
            plan_guid: Uuid::parse_str(PLAN).unwrap(),
            valid_from: at(valid_from),
            name: "app".to_string(),
            memory_in_mb: 0,
            storage_in_mb: 0,
            number_of_nodes: 0,
            components: vec![PricingPlanComponent {
                name: "compute".to_string(),
                formula: formula.to_string(),
                vat_code: VatCode::Standard,
                currency_code: CurrencyCode::Usd,
            }],
        }
    }

    fn config() -> Config {
        Config {
            vat_rates: vec![VatRate {
                code: VatCode::Standard,
                valid_from: range::epoch(),
                rate: dec!(0.2),
            }],
            currency_rates: vec![
                CurrencyRate {
                    code: CurrencyCode::Gbp,
                    valid_from: range::epoch(),
                    rate: dec!(1),
                },
                CurrencyRate {
                    code: CurrencyCode::Usd,
                    valid_from: at("2001-01-01"),
                    rate: dec!(0.8),
                },
                CurrencyRate {
                    code: CurrencyCode::Usd,
                    valid_from: at("2001-02-15"),
                    rate: dec!(0.9),
                },
            ],
            pricing_plans: vec![
                plan("2001-01-01", "$time_in_seconds * 0.01"),
                plan("2001-03-01", "$time_in_seconds * 0.02"),
            ],
            ignore_missing_plans: false,
        }
    }

    async fn conn() -> SqliteConnection {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        schema::apply(&mut conn).await.unwrap();
        conn
    }

    #[test]
    fn test_valid_config() {
        validate_config(&config()).unwrap();
    }

    #[test]
    fn test_plan_must_start_on_month() {
        let mut cfg = config();
        cfg.pricing_plans[0].valid_from = at("2001-01-02");
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, BillingError::Reference(ReferenceError::InvalidReference { .. })));
    }

    #[test]
    fn test_currency_may_start_mid_month_but_not_mid_day() {
        let mut cfg = config();
        cfg.currency_rates[2].valid_from = at("2001-02-15T12:00:00Z");
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_bad_formula_rejected() {
        let mut cfg = config();
        cfg.pricing_plans[1].components[0].formula = "$time_in_seconds * ;".to_string();
        let err = validate_config(&cfg).unwrap_err();
        assert_eq!(err.to_string(), "illegal token in formula: ;");
    }

    #[test]
    fn test_missing_rates_named() {
        let mut cfg = config();
        cfg.pricing_plans[0].valid_from = at("2000-12-01");
        let err = validate_config(&cfg).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("missing currency_rate for 'USD' for period '2000-12-01T00:00:00+00:00' required by plan '{PLAN}'")
        );

        let mut cfg = config();
        cfg.vat_rates[0].code = VatCode::Reduced;
        let err = validate_config(&cfg).unwrap_err();
        assert!(err.to_string().starts_with("missing vat_rate for 'Standard'"));
    }

    #[test]
    fn test_duplicate_versions_and_components() {
        let mut cfg = config();
        cfg.pricing_plans.push(plan("2001-01-01", "0"));
        assert!(validate_config(&cfg).is_err());

        let mut cfg = config();
        let extra = cfg.pricing_plans[0].components[0].clone();
        cfg.pricing_plans[0].components.push(extra);
        assert!(validate_config(&cfg).is_err());

        let mut cfg = config();
        cfg.pricing_plans[0].components.clear();
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_gbp_rate_must_be_one() {
        let mut cfg = config();
        cfg.currency_rates[0].rate = dec!(1.1);
        assert!(validate_config(&cfg).is_err());
    }

    #[tokio::test]
    async fn test_apply_then_read_back() {
        let mut conn = conn().await;
        let cfg = config();
        apply_config(&mut conn, &cfg).await.unwrap();
        apply_config(&mut conn, &cfg).await.unwrap();

        let stored = read_config(&mut conn).await.unwrap();
        assert_eq!(stored.pricing_plans, cfg.pricing_plans);
        assert_eq!(stored.vat_rates, cfg.vat_rates);
        assert_eq!(stored.currency_rates, cfg.currency_rates);
    }

    #[tokio::test]
    async fn test_range_reads_follow_validity() {
        let mut conn = conn().await;
        apply_config(&mut conn, &config()).await.unwrap();

        let feb = RangeFilter {
            range_start: at("2001-02-01"),
            range_stop: at("2001-03-01"),
        };
        let plans = get_pricing_plans(&mut conn, &feb).await.unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].valid_from, at("2001-01-01"));

        let rates = get_currency_rates(&mut conn, &feb).await.unwrap();
        let usd: Vec<_> = rates.iter().filter(|r| r.code == CurrencyCode::Usd).collect();
        assert_eq!(usd.len(), 2);
        assert_eq!(usd[1].rate, dec!(0.9));

        let later = RangeFilter {
            range_start: at("2005-01-01"),
            range_stop: at("2005-02-01"),
        };
        let plans = get_pricing_plans(&mut conn, &later).await.unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].valid_from, at("2001-03-01"));
        assert_eq!(get_vat_rates(&mut conn, &later).await.unwrap().len(), 1);
    }

    #[test]
    fn test_gauges_use_current_version() {
        let metrics = StoreMetrics::new().unwrap();
        let reference = ReferenceData::from_config(&config());
        set_gauges(&metrics, &reference, at("2001-02-20"));
        assert_eq!(metrics.currency_gauge("USD").get(), 0.9);
        assert_eq!(metrics.vat_gauge("Standard").get(), 0.2);
    }
}
