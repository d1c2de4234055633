//! Forecasts
//!
//! Prices hypothetical usage against the stored reference data. Everything
//! happens in memory, so forecast inputs are never visible to other reads.

use chrono::{DateTime, Utc};
use paasbill_common::{
    BillableEvent, EventFilter, ReferenceError, Result, UsageEvent, ValidationError,
    DUMMY_ORG_GUID,
};

use super::aggregate;
use crate::metering::UsageInterval;
use crate::pricing::{compose_all, FormulaCache};
use crate::reference::ReferenceData;

/// Rejects inputs that do not belong to the forecast organisation or that
/// are malformed
pub fn validate_inputs(inputs: &[UsageEvent]) -> Result<()> {
    for input in inputs {
        input.validate()?;
        if input.org_guid != DUMMY_ORG_GUID {
            return Err(ValidationError::InvalidField {
                field: "org_guid".to_string(),
                reason: format!("forecast events must use org_guid {DUMMY_ORG_GUID}"),
            }
            .into());
        }
    }
    Ok(())
}

/// Billable events for `inputs` within `filter`, ordered by event GUID
pub fn forecast(
    inputs: &[UsageEvent],
    filter: &EventFilter,
    reference: &ReferenceData,
    now: DateTime<Utc>,
    formulas: &FormulaCache,
) -> Result<Vec<BillableEvent>> {
    filter.validate()?;
    validate_inputs(inputs)?;

    let intervals: Vec<UsageInterval> = inputs
        .iter()
        .map(UsageInterval::from_forecast_input)
        .filter(|i| !i.duration.is_empty())
        .collect();
    for interval in &intervals {
        let covered = reference
            .plan_versions(&interval.plan_guid)
            .iter()
            .any(|v| v.valid_for.overlaps(&interval.duration));
        if !covered {
            return Err(ReferenceError::MissingPlan {
                plan_guid: interval.plan_guid.to_string(),
                plan_name: interval.plan_name.clone(),
                resource_type: interval.resource_type.clone(),
            }
            .into());
        }
    }

    let slices = compose_all(&intervals, reference);
    let events = aggregate(&slices, filter.time_range(), now, formulas)?;
    Ok(events
        .into_iter()
        .filter(|e| filter.matches_org(&e.org_guid))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use paasbill_common::types::range::{epoch, parse_instant};
    use paasbill_common::{
        BillingError, Config, CurrencyCode, CurrencyRate, PricingPlan, PricingPlanComponent,
        VatCode, VatRate, DUMMY_SPACE_GUID,
    };
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    const PLAN: u128 = 0x8f7d5d4c_0000_4000_8000_000000000001;

    fn at(s: &str) -> DateTime<Utc> {
        parse_instant(s).unwrap()
    }

    fn reference() -> ReferenceData {
        ReferenceData::from_config(&Config {
            vat_rates: vec![VatRate { code: VatCode::Standard, valid_from: epoch(), rate: dec!(0.2) }],
            currency_rates: vec![CurrencyRate { code: CurrencyCode::Gbp, valid_from: epoch(), rate: dec!(1) }],
            pricing_plans: vec![PricingPlan {
                plan_guid: Uuid::from_u128(PLAN),
                valid_from: at("2017-01-01"),
                name: "postgres small".to_string(),
                memory_in_mb: 0,
                storage_in_mb: 0,
                number_of_nodes: 0,
                components: vec![PricingPlanComponent {
                    name: "instance".to_string(),
                    formula: "ceil($time_in_seconds / 3600) * 0.5".to_string(),
                    vat_code: VatCode::Standard,
                    currency_code: CurrencyCode::Gbp,
                }],
            }],
            ignore_missing_plans: false,
        })
    }

    fn input(org: Uuid, plan: u128) -> UsageEvent {
        UsageEvent {
            event_guid: Uuid::from_u128(11),
            event_start: at("2021-03-01"),
            event_stop: at("2021-03-02"),
            resource_guid: Uuid::from_u128(12),
            resource_name: "db".to_string(),
            resource_type: "postgres".to_string(),
            org_guid: org,
            space_guid: DUMMY_SPACE_GUID,
            plan_guid: Uuid::from_u128(plan),
            plan_name: "small".to_string(),
            service_guid: None,
            service_name: None,
            number_of_nodes: 1,
            memory_in_mb: 0,
            storage_in_mb: 0,
        }
    }

    #[test]
    fn test_forecast_prices_inputs() {
        let filter = EventFilter::new(at("2021-03-01"), at("2021-04-01")).with_orgs(vec![DUMMY_ORG_GUID]);
        let events = forecast(
            &[input(DUMMY_ORG_GUID, PLAN)],
            &filter,
            &reference(),
            at("2021-01-01"),
            &FormulaCache::new(),
        )
        .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].plan_name, "simulated");
        assert_eq!(events[0].org_name, "my-org");
        assert_eq!(events[0].price.ex_vat, dec!(12));
        assert_eq!(events[0].price.inc_vat, dec!(14.4));
    }

    #[test]
    fn test_forecast_rejects_other_orgs() {
        let filter = EventFilter::new(at("2021-03-01"), at("2021-04-01"));
        let err = forecast(
            &[input(Uuid::from_u128(99), PLAN)],
            &filter,
            &reference(),
            at("2021-01-01"),
            &FormulaCache::new(),
        )
        .unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn test_forecast_unknown_plan() {
        let filter = EventFilter::new(at("2021-03-01"), at("2021-04-01"));
        let err = forecast(
            &[input(DUMMY_ORG_GUID, 1)],
            &filter,
            &reference(),
            at("2021-01-01"),
            &FormulaCache::new(),
        )
        .unwrap_err();
        assert!(matches!(err, BillingError::Reference(ReferenceError::MissingPlan { .. })));
    }
}
