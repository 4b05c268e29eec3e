//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use quillcheck_billing::BillingError;
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error("Signature verification failed")]
    InvalidSignature,
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Gone: {0}")]
    Gone(String),
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("Payment gateway error")]
    Gateway,
    #[error("Service busy, retry later")]
    Busy,
    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::InvalidSignature => {
                (StatusCode::UNAUTHORIZED, "INVALID_SIGNATURE", self.to_string())
            }
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            ApiError::Gone(msg) => (StatusCode::GONE, "GONE", msg.clone()),
            ApiError::QuotaExceeded(msg) => {
                (StatusCode::PAYMENT_REQUIRED, "QUOTA_EXCEEDED", msg.clone())
            }
            ApiError::Gateway => (StatusCode::BAD_GATEWAY, "GATEWAY_ERROR", self.to_string()),
            ApiError::Busy => (StatusCode::SERVICE_UNAVAILABLE, "BUSY", self.to_string()),
            ApiError::Internal => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string())
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::PlanNotFound(_)
            | BillingError::OrderNotFound(_)
            | BillingError::QuotaNotFound { .. } => ApiError::NotFound(err.to_string()),
            BillingError::InsufficientQuota { .. } | BillingError::QuotaExpired(_) => {
                ApiError::QuotaExceeded(err.to_string())
            }
            BillingError::OrderAlreadyPaid(_)
            | BillingError::InvalidOrderState(_)
            | BillingError::AlreadySubscribed(_)
            | BillingError::Conflict(_) => ApiError::Conflict(err.to_string()),
            BillingError::OrderExpired(_) => ApiError::Gone(err.to_string()),
            BillingError::InvalidUpgrade(_) | BillingError::InvalidInput(_) => {
                ApiError::BadRequest(err.to_string())
            }
            BillingError::InvalidSignature => ApiError::InvalidSignature,
            BillingError::Transient(msg) => {
                tracing::warn!(error = %msg, "transient billing failure");
                ApiError::Busy
            }
            BillingError::Gateway(msg) => {
                tracing::error!(error = %msg, "payment gateway failure");
                ApiError::Gateway
            }
            BillingError::Database(msg) | BillingError::Config(msg) => {
                tracing::error!(error = %msg, "internal billing failure");
                ApiError::Internal
            }
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!(error = %err, "database error");
        ApiError::Internal
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
