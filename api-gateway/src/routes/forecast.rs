//! Pricing of hypothetical usage
//!
//! Open to anyone: only the dummy org can be forecast and nothing is stored.

use axum::extract::{Query, State};
use axum::response::Response;
use paasbill_common::{BillingError, EventFilter, UsageEvent, DUMMY_ORG_GUID};
use uuid::Uuid;

use super::params::QueryParams;
use super::stream::json_array;
use crate::error::ApiError;
use crate::state::AppState;

pub async fn forecast_events(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Response, ApiError> {
    let params = QueryParams::new(params);
    for guid in params.all("org_guid") {
        if Uuid::parse_str(guid).ok() != Some(DUMMY_ORG_GUID) {
            return Err(ApiError::Forbidden(format!(
                "you are not authorized to forecast events for org '{guid}'"
            )));
        }
    }
    let filter = EventFilter::parse::<&str>(params.get("range_start"), params.get("range_stop"), &[])?
        .with_orgs(vec![DUMMY_ORG_GUID]);

    let events = params
        .get("events")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest("events param is required".to_string()))?;
    let inputs: Vec<UsageEvent> =
        serde_json::from_str(events).map_err(|e| ApiError::BadRequest(format!("invalid events param: {e}")))?;

    let rows = state
        .store
        .forecast_billable_event_rows(inputs, &filter)
        .await
        .map_err(input_error)?;
    // pricing runs in the producer, so plan lookups fail on the first row
    json_array(rows).await.map_err(|err| match err {
        ApiError::Billing(err) => input_error(err),
        other => other,
    })
}

/// A forecast naming an unknown plan is a bad request, not a server fault
fn input_error(err: BillingError) -> ApiError {
    match err {
        BillingError::Reference(err) => ApiError::BadRequest(err.to_string()),
        other => ApiError::Billing(other),
    }
}
