//! Accumulated cost per plan over every stored slice

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use paasbill_common::types::range::epoch;
use paasbill_common::{Result, TimeRange, TotalCost};
use rust_decimal::{Decimal, RoundingStrategy};
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::db::storage_error;
use crate::pricing::composer::{slice_from_row, COMPONENT_COLUMNS};
use crate::pricing::{ComponentSlice, FormulaCache};

/// Running sum of ex-VAT cost per plan
#[derive(Debug, Default)]
pub struct CostTotals {
    by_plan: BTreeMap<Uuid, Decimal>,
}

impl CostTotals {
    /// Adds the whole of `slice`, open slices up to `now`
    pub fn add(&mut self, slice: &ComponentSlice, now: DateTime<Utc>, formulas: &FormulaCache) -> Result<()> {
        if let Some(price) = slice.price(&TimeRange::open(epoch()), now, formulas)? {
            *self.by_plan.entry(slice.plan_guid).or_default() += price.ex_vat;
        }
        Ok(())
    }

    /// Totals rounded to pence, ordered by plan GUID
    pub fn into_totals(self) -> Vec<TotalCost> {
        self.by_plan
            .into_iter()
            .map(|(plan_guid, cost)| TotalCost {
                plan_guid,
                cost: cost.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero),
            })
            .collect()
    }
}

pub(crate) async fn total_cost(
    conn: &mut SqliteConnection,
    now: DateTime<Utc>,
    formulas: &FormulaCache,
) -> Result<Vec<TotalCost>> {
    let statement = format!("SELECT {COMPONENT_COLUMNS} FROM billable_event_components");
    let mut rows = sqlx::query(&statement).fetch(&mut *conn);
    let mut totals = CostTotals::default();
    while let Some(row) = rows.try_next().await.map_err(storage_error)? {
        totals.add(&slice_from_row(&row)?, now, formulas)?;
    }
    Ok(totals.into_totals())
}

#[cfg(test)]
mod tests {
    use super::*;
    use paasbill_common::types::range::parse_instant;
    use paasbill_common::{CurrencyCode, VatCode};
    use rust_decimal_macros::dec;

    fn at(s: &str) -> DateTime<Utc> {
        parse_instant(s).unwrap()
    }

    fn slice(plan: u128, duration: TimeRange) -> ComponentSlice {
        ComponentSlice {
            event_guid: Uuid::from_u128(1),
            resource_guid: Uuid::from_u128(2),
            resource_name: "web".to_string(),
            resource_type: "app".to_string(),
            org_guid: Uuid::from_u128(3),
            org_name: "org".to_string(),
            space_guid: Uuid::from_u128(4),
            space_name: "space".to_string(),
            plan_guid: Uuid::from_u128(plan),
            plan_name: "app".to_string(),
            event_plan_name: "app".to_string(),
            plan_valid_from: epoch(),
            component_name: "compute".to_string(),
            component_formula: "$time_in_seconds * 0.0001".to_string(),
            vat_code: VatCode::Standard,
            vat_rate: dec!(0.2),
            currency_code: CurrencyCode::Gbp,
            currency_rate: dec!(1),
            number_of_nodes: 1,
            memory_in_mb: 0,
            storage_in_mb: 0,
            duration,
        }
    }

    #[test]
    fn test_totals_per_plan() {
        let formulas = FormulaCache::new();
        let now = at("2021-01-02");
        let mut totals = CostTotals::default();
        // 3600s -> 0.36
        totals
            .add(&slice(2, TimeRange::new(at("2021-01-01"), at("2021-01-01T01:00:00Z"))), now, &formulas)
            .unwrap();
        // open, priced until now: 86400s -> 8.64
        totals.add(&slice(1, TimeRange::open(at("2021-01-01"))), now, &formulas).unwrap();
        // 45s -> 0.0045 -> rounds with the first slice of plan 2
        totals
            .add(&slice(2, TimeRange::new(at("2021-01-01"), at("2021-01-01T00:00:45Z"))), now, &formulas)
            .unwrap();

        let totals = totals.into_totals();
        assert_eq!(totals.len(), 2);
        assert_eq!(totals[0].plan_guid, Uuid::from_u128(1));
        assert_eq!(totals[0].cost, dec!(8.64));
        assert_eq!(totals[1].cost, dec!(0.36));
    }
}
