//! HTTP API for the PaaS billing engine
//!
//! Serves usage and billable events, reference data, forecasts, totals,
//! metrics and health from an [`paasbill_eventstore::EventStore`].

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::AppConfig;
pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
