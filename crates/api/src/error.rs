//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use coachhub_billing::BillingError;
use serde_json::json;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            ApiError::Billing(err) => match err {
                BillingError::TrialAlreadyUsed | BillingError::TrialNotEligible(_) => {
                    (StatusCode::CONFLICT, err.to_string())
                }
                BillingError::ConcurrentModification(_) => (
                    StatusCode::CONFLICT,
                    "Subscription is being changed by another request, please retry".to_string(),
                ),
                // Fail closed: never guess entitlements without the store
                BillingError::StorageUnavailable(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Entitlement data temporarily unavailable".to_string(),
                ),
                BillingError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{} not found", what)),
                BillingError::InvalidTier(tier) => {
                    (StatusCode::BAD_REQUEST, format!("Unknown tier '{}'", tier))
                }
                BillingError::UpgradeRequiresPayment(_) => (
                    StatusCode::FORBIDDEN,
                    "Upgrades are applied once payment completes".to_string(),
                ),
                BillingError::DataIntegrity(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                ),
            },
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message.clone()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();

        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
