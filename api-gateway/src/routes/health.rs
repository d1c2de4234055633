use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::state::AppState;

/// `{"ok": true}` while the database answers
pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "ok": true }))),
        Err(err) => {
            warn!(error = %err, "event store ping failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "ok": false })))
        }
    }
}
