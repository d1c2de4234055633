//! HTTP error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use paasbill_common::BillingError;
use serde_json::json;
use thiserror::Error;

pub const UNAUTHORIZED_MESSAGE: &str =
    "you need to be billing_manager or an administrator to retrieve the billing data";

/// Errors returned by request handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("you need to be billing_manager or an administrator to retrieve the billing data")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Billing(err) if err.is_client_error() => StatusCode::BAD_REQUEST,
            ApiError::Billing(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
            "internal server error".to_string()
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "request rejected");
            self.to_string()
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paasbill_common::ValidationError;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Forbidden("no".into()).status(), StatusCode::FORBIDDEN);
        let invalid = BillingError::from(ValidationError::InvalidRange("reversed".into()));
        assert_eq!(ApiError::from(invalid).status(), StatusCode::BAD_REQUEST);
        let storage = BillingError::Storage("disk full".into());
        assert_eq!(ApiError::from(storage).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_unauthorized_message() {
        assert_eq!(ApiError::Unauthorized.to_string(), UNAUTHORIZED_MESSAGE);
    }
}
