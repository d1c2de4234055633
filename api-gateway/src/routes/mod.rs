//! Route definitions
//!
//! ## Routes
//!
//! - `GET /` - store health
//! - `GET /pricing_plans`, `/vat_rates`, `/currency_rates` - reference data
//! - `GET /usage_events`, `/billable_events` - tenant data, bearer auth
//! - `GET /forecast_events` - prices hypothetical usage for the dummy org
//! - `GET /totals` - accumulated cost per plan
//! - `GET /metrics` - Prometheus exposition

mod events;
mod forecast;
mod health;
mod metrics;
mod params;
mod reference;
mod stream;
mod totals;

use axum::http::header::{CACHE_CONTROL, EXPIRES, PRAGMA};
use axum::http::HeaderValue;
use axum::routing::get;
use axum::Router;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Builds the API router. Responses are never cacheable.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health::status))
        .route("/pricing_plans", get(reference::pricing_plans))
        .route("/vat_rates", get(reference::vat_rates))
        .route("/currency_rates", get(reference::currency_rates))
        .route("/usage_events", get(events::usage_events))
        .route("/billable_events", get(events::billable_events))
        .route("/forecast_events", get(forecast::forecast_events))
        .route("/totals", get(totals::totals))
        .route("/metrics", get(metrics::metrics))
        .with_state(state)
        .layer(SetResponseHeaderLayer::overriding(CACHE_CONTROL, HeaderValue::from_static("no-store")))
        .layer(SetResponseHeaderLayer::overriding(PRAGMA, HeaderValue::from_static("no-cache")))
        .layer(SetResponseHeaderLayer::overriding(EXPIRES, HeaderValue::from_static("0")))
        .layer(TraceLayer::new_for_http())
}
