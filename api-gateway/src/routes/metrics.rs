use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use prometheus::{Encoder, TextEncoder};

use crate::error::ApiError;
use crate::state::AppState;

/// Prometheus text exposition of the application registry
pub async fn metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&state.registry.gather(), &mut buf)
        .map_err(|e| ApiError::Internal(format!("failed to encode metrics: {e}")))?;
    Ok(([(CONTENT_TYPE, encoder.format_type().to_string())], buf).into_response())
}
