//! Billable composer
//!
//! Splits each usage interval at every change of plan version, currency rate
//! and VAT rate, producing one [`ComponentSlice`] per plan component per
//! slice. Prices are not stored: they depend on the read window, so they are
//! evaluated by [`ComponentSlice::price`] when the slice is read.

use chrono::{DateTime, Utc};
use paasbill_common::{
    CurrencyCode, PriceComponent, Result, TimeRange, VatCode, FORMULA_SCALE, MIN_CHARGE,
};
use rust_decimal::{Decimal, RoundingStrategy};
use sqlx::sqlite::SqliteRow;
use sqlx::SqliteConnection;
use uuid::Uuid;

use super::formula::{FormulaCache, Vars};
use crate::db::{
    self, get_decimal, get_i64, get_instant, get_range, get_string, get_uuid, storage_error,
};
use crate::metering::UsageInterval;
use crate::reference::ReferenceData;

/// One component of one plan version over the part of an interval where the
/// plan version, currency rate and VAT rate are all fixed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSlice {
    pub event_guid: Uuid,
    pub resource_guid: Uuid,
    pub resource_name: String,
    pub resource_type: String,
    pub org_guid: Uuid,
    pub org_name: String,
    pub space_guid: Uuid,
    pub space_name: String,
    pub plan_guid: Uuid,
    /// Name of the plan version
    pub plan_name: String,
    /// Plan name carried by the usage interval
    pub event_plan_name: String,
    pub plan_valid_from: DateTime<Utc>,
    pub component_name: String,
    pub component_formula: String,
    pub vat_code: VatCode,
    pub vat_rate: Decimal,
    pub currency_code: CurrencyCode,
    pub currency_rate: Decimal,
    pub number_of_nodes: i64,
    pub memory_in_mb: i64,
    pub storage_in_mb: i64,
    pub duration: TimeRange,
}

impl ComponentSlice {
    /// Prices the part of this slice inside `window`. Open slices end at
    /// `min(now, window.hi)`. Returns `None` when nothing of the slice falls
    /// inside the window.
    pub fn price(
        &self,
        window: &TimeRange,
        now: DateTime<Utc>,
        formulas: &FormulaCache,
    ) -> Result<Option<PriceComponent>> {
        let ceiling = window.hi.map_or(now, |hi| hi.min(now));
        let Some(clipped) = self.duration.close_at(ceiling).intersect(window) else {
            return Ok(None);
        };
        let (Some(stop), Some(seconds)) = (clipped.hi, clipped.seconds()) else {
            return Ok(None);
        };

        let vars = Vars {
            time_in_seconds: seconds,
            memory_in_mb: Decimal::from(self.memory_in_mb),
            storage_in_mb: Decimal::from(self.storage_in_mb),
            number_of_nodes: Decimal::from(self.number_of_nodes),
        };
        let value = formulas
            .get_or_parse(&self.component_formula)?
            .eval(&vars)?
            .round_dp_with_strategy(FORMULA_SCALE, RoundingStrategy::MidpointAwayFromZero);
        let (ex_vat, inc_vat) = charge(value, self.currency_rate, self.vat_rate);

        Ok(Some(PriceComponent {
            name: self.component_name.clone(),
            plan_name: self.plan_name.clone(),
            start: clipped.lo,
            stop,
            vat_rate: self.vat_rate.normalize(),
            vat_code: self.vat_code,
            currency_code: CurrencyCode::Gbp,
            currency_rate: self.currency_rate.normalize(),
            ex_vat,
            inc_vat,
        }))
    }
}

/// Converts a formula result to GBP and applies the minimum charge and VAT
pub fn charge(value: Decimal, currency_rate: Decimal, vat_rate: Decimal) -> (Decimal, Decimal) {
    let ex_vat = (value * currency_rate).max(MIN_CHARGE);
    let inc_vat = ex_vat * (Decimal::ONE + vat_rate);
    (ex_vat.normalize(), inc_vat.normalize())
}

/// Slices one interval against the reference data. Slices come out ordered
/// by start time, then by the plan's component order.
pub fn compose(interval: &UsageInterval, reference: &ReferenceData) -> Vec<ComponentSlice> {
    let mut slices = Vec::new();
    for plan in reference.plan_versions(&interval.plan_guid) {
        let Some(plan_window) = interval.duration.intersect(&plan.valid_for) else {
            continue;
        };
        let plan = &plan.value;
        let number_of_nodes = interval.number_of_nodes.unwrap_or(plan.number_of_nodes);
        let memory_in_mb = interval.memory_in_mb.unwrap_or(plan.memory_in_mb);
        let storage_in_mb = interval.storage_in_mb.unwrap_or(plan.storage_in_mb);

        for component in &plan.components {
            for currency in reference.currency_versions(component.currency_code) {
                let Some(currency_window) = plan_window.intersect(&currency.valid_for) else {
                    continue;
                };
                for vat in reference.vat_versions(component.vat_code) {
                    let Some(duration) = currency_window.intersect(&vat.valid_for) else {
                        continue;
                    };
                    slices.push(ComponentSlice {
                        event_guid: interval.event_guid,
                        resource_guid: interval.resource_guid,
                        resource_name: interval.resource_name.clone(),
                        resource_type: interval.resource_type.clone(),
                        org_guid: interval.org_guid,
                        org_name: interval.org_name.clone(),
                        space_guid: interval.space_guid,
                        space_name: interval.space_name.clone(),
                        plan_guid: interval.plan_guid,
                        plan_name: plan.name.clone(),
                        event_plan_name: interval.plan_name.clone(),
                        plan_valid_from: plan.valid_from,
                        component_name: component.name.clone(),
                        component_formula: component.formula.clone(),
                        vat_code: component.vat_code,
                        vat_rate: vat.value,
                        currency_code: component.currency_code,
                        currency_rate: currency.value,
                        number_of_nodes,
                        memory_in_mb,
                        storage_in_mb,
                        duration,
                    });
                }
            }
        }
    }
    // stable sort keeps component order within a start time
    slices.sort_by_key(|s| s.duration.lo);
    slices
}

pub fn compose_all(intervals: &[UsageInterval], reference: &ReferenceData) -> Vec<ComponentSlice> {
    intervals
        .iter()
        .flat_map(|interval| compose(interval, reference))
        .collect()
}

pub(crate) const COMPONENT_COLUMNS: &str = "event_guid, resource_guid, resource_name, \
     resource_type, org_guid, org_name, space_guid, space_name, plan_guid, plan_name, \
     event_plan_name, plan_valid_from, component_name, component_formula, vat_code, vat_rate, \
     currency_code, currency_rate, number_of_nodes, memory_in_mb, storage_in_mb, duration_lo, \
     duration_hi";

/// Replaces the `billable_event_components` relation
pub(crate) async fn replace_components(
    conn: &mut SqliteConnection,
    slices: &[ComponentSlice],
) -> Result<()> {
    sqlx::query("DELETE FROM billable_event_components")
        .execute(&mut *conn)
        .await
        .map_err(storage_error)?;

    let statement = format!(
        "INSERT INTO billable_event_components ({COMPONENT_COLUMNS}) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    for slice in slices {
        sqlx::query(&statement)
            .bind(db::guid_text(&slice.event_guid))
            .bind(db::guid_text(&slice.resource_guid))
            .bind(&slice.resource_name)
            .bind(&slice.resource_type)
            .bind(db::guid_text(&slice.org_guid))
            .bind(&slice.org_name)
            .bind(db::guid_text(&slice.space_guid))
            .bind(&slice.space_name)
            .bind(db::guid_text(&slice.plan_guid))
            .bind(&slice.plan_name)
            .bind(&slice.event_plan_name)
            .bind(db::micros(slice.plan_valid_from))
            .bind(&slice.component_name)
            .bind(&slice.component_formula)
            .bind(slice.vat_code.as_str())
            .bind(db::decimal_text(&slice.vat_rate))
            .bind(slice.currency_code.as_str())
            .bind(db::decimal_text(&slice.currency_rate))
            .bind(slice.number_of_nodes)
            .bind(slice.memory_in_mb)
            .bind(slice.storage_in_mb)
            .bind(db::micros(slice.duration.lo))
            .bind(db::opt_micros(slice.duration.hi))
            .execute(&mut *conn)
            .await
            .map_err(storage_error)?;
    }
    Ok(())
}

pub(crate) fn slice_from_row(row: &SqliteRow) -> Result<ComponentSlice> {
    Ok(ComponentSlice {
        event_guid: get_uuid(row, "event_guid")?,
        resource_guid: get_uuid(row, "resource_guid")?,
        resource_name: get_string(row, "resource_name")?,
        resource_type: get_string(row, "resource_type")?,
        org_guid: get_uuid(row, "org_guid")?,
        org_name: get_string(row, "org_name")?,
        space_guid: get_uuid(row, "space_guid")?,
        space_name: get_string(row, "space_name")?,
        plan_guid: get_uuid(row, "plan_guid")?,
        plan_name: get_string(row, "plan_name")?,
        event_plan_name: get_string(row, "event_plan_name")?,
        plan_valid_from: get_instant(row, "plan_valid_from")?,
        component_name: get_string(row, "component_name")?,
        component_formula: get_string(row, "component_formula")?,
        vat_code: get_string(row, "vat_code")?.parse()?,
        vat_rate: get_decimal(row, "vat_rate")?,
        currency_code: get_string(row, "currency_code")?.parse()?,
        currency_rate: get_decimal(row, "currency_rate")?,
        number_of_nodes: get_i64(row, "number_of_nodes")?,
        memory_in_mb: get_i64(row, "memory_in_mb")?,
        storage_in_mb: get_i64(row, "storage_in_mb")?,
        duration: get_range(row, "duration")?,
    })
}

/// SQL selecting slices overlapping `[?, ?)` with `org_count` org
/// placeholders, ordered for streaming aggregation
pub(crate) fn overlapping_components_sql(org_count: usize) -> String {
    let mut statement = format!(
        "SELECT {COMPONENT_COLUMNS} FROM billable_event_components \
         WHERE (duration_hi IS NULL OR duration_hi > ?) AND duration_lo < ?"
    );
    if org_count > 0 {
        let placeholders = vec!["?"; org_count].join(", ");
        statement.push_str(&format!(" AND org_guid IN ({placeholders})"));
    }
    statement.push_str(" ORDER BY event_guid, duration_lo, rowid");
    statement
}

/// Event GUIDs with slices overlapping `[?, ?)` that sort after `?`, at most
/// `?` of them
pub(crate) const NEXT_EVENT_PAGE_SQL: &str = "SELECT DISTINCT event_guid FROM billable_event_components \
     WHERE (duration_hi IS NULL OR duration_hi > ?) AND duration_lo < ? AND event_guid > ? \
     ORDER BY event_guid LIMIT ?";

/// SQL selecting slices overlapping `[?, ?)` whose event GUID is in `(?, ?]`
pub(crate) fn paged_components_sql() -> String {
    format!(
        "SELECT {COMPONENT_COLUMNS} FROM billable_event_components \
         WHERE (duration_hi IS NULL OR duration_hi > ?) AND duration_lo < ? \
         AND event_guid > ? AND event_guid <= ? \
         ORDER BY event_guid, duration_lo, rowid"
    )
}

/// Every stored slice, in insertion order
pub(crate) async fn load_components(conn: &mut SqliteConnection) -> Result<Vec<ComponentSlice>> {
    let statement =
        format!("SELECT {COMPONENT_COLUMNS} FROM billable_event_components ORDER BY rowid");
    let rows = sqlx::query(&statement)
        .fetch_all(&mut *conn)
        .await
        .map_err(storage_error)?;
    rows.iter().map(slice_from_row).collect()
}
