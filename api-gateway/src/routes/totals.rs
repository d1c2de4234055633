use axum::extract::State;
use axum::Json;
use paasbill_common::TotalCost;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn totals(State(state): State<AppState>) -> Result<Json<Vec<TotalCost>>, ApiError> {
    Ok(Json(state.store.get_total_cost().await?))
}
