//! Versioned reference data overlapping a range

use axum::extract::{Query, State};
use axum::Json;
use paasbill_common::{CurrencyRate, PricingPlan, VatRate};

use super::params::QueryParams;
use crate::error::ApiError;
use crate::state::AppState;

pub async fn pricing_plans(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<Vec<PricingPlan>>, ApiError> {
    let filter = QueryParams::new(params).range_filter()?;
    Ok(Json(state.store.get_pricing_plans(&filter).await?))
}

pub async fn vat_rates(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<Vec<VatRate>>, ApiError> {
    let filter = QueryParams::new(params).range_filter()?;
    Ok(Json(state.store.get_vat_rates(&filter).await?))
}

pub async fn currency_rates(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<Vec<CurrencyRate>>, ApiError> {
    let filter = QueryParams::new(params).range_filter()?;
    Ok(Json(state.store.get_currency_rates(&filter).await?))
}
