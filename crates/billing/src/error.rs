//! Billing error types

use quillcheck_shared::QuotaType;
use thiserror::Error;
use uuid::Uuid;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Plan not found: {0}")]
    PlanNotFound(Uuid),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("No {quota_type} quota for user {user_id}")]
    QuotaNotFound { user_id: Uuid, quota_type: QuotaType },

    #[error("{0} quota has expired")]
    QuotaExpired(QuotaType),

    #[error("Insufficient quota: requested {requested}, remaining {remaining}")]
    InsufficientQuota { requested: i64, remaining: i64 },

    #[error("Order already paid: {0}")]
    OrderAlreadyPaid(String),

    #[error("Order expired: {0}")]
    OrderExpired(String),

    #[error("Invalid order state: {0}")]
    InvalidOrderState(String),

    #[error("Invalid upgrade: {0}")]
    InvalidUpgrade(String),

    #[error("User {0} already has an active membership")]
    AlreadySubscribed(Uuid),

    #[error("Callback signature verification failed")]
    InvalidSignature,

    #[error("Concurrent modification detected: {0}")]
    Conflict(String),

    #[error("Transient failure, retry later: {0}")]
    Transient(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
