//! Tenant usage and billable events

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;

use super::params::QueryParams;
use super::stream::json_array;
use crate::auth::authorize;
use crate::error::ApiError;
use crate::state::AppState;

pub async fn usage_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Response, ApiError> {
    let filter = QueryParams::new(params).event_filter()?;
    authorize(state.authenticator.as_ref(), &headers, &filter.org_guids).await?;
    json_array(state.store.get_usage_event_rows(&filter).await?).await
}

/// Consolidated months come from the snapshot, the rest is priced live
pub async fn billable_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Response, ApiError> {
    let filter = QueryParams::new(params).event_filter()?;
    authorize(state.authenticator.as_ref(), &headers, &filter.org_guids).await?;
    json_array(state.store.get_auto_billable_event_rows(&filter).await?).await
}
