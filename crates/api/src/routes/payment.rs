//! Payment endpoints
//!
//! The gateway callback replies with a literal `success`/`fail` body, which
//! is the gateway's retry protocol: `fail` makes it redeliver, `success`
//! stops redelivery. A failed trade still answers `success` because the
//! outcome was recorded; only errors on our side ask for a retry.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use quillcheck_billing::{BillingError, GatewayCallback, PaymentStatus, ReconciliationResult};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

/// Asynchronous payment notification from the gateway
pub async fn callback(
    State(state): State<AppState>,
    Json(payload): Json<GatewayCallback>,
) -> (StatusCode, &'static str) {
    match state.reconciler.handle_callback(&payload).await {
        Ok(result) => {
            tracing::debug!(order_no = %payload.order_id, result = ?result, "callback handled");
            (StatusCode::OK, "success")
        }
        Err(BillingError::InvalidSignature) => (StatusCode::UNAUTHORIZED, "fail"),
        Err(e) => {
            tracing::error!(order_no = %payload.order_id, error = %e, "callback failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "fail")
        }
    }
}

#[derive(Deserialize)]
pub struct CompleteRequest {
    pub order_id: Uuid,
}

/// Manual payment completion for test environments and support operations
pub async fn complete(
    State(state): State<AppState>,
    Json(payload): Json<CompleteRequest>,
) -> ApiResult<Json<ReconciliationResult>> {
    let result = state.reconciler.complete_payment(payload.order_id).await?;
    Ok(Json(result))
}

/// Payment status for polling clients
pub async fn status(
    State(state): State<AppState>,
    Path(order_no): Path<String>,
) -> ApiResult<Json<PaymentStatus>> {
    let status = state.reconciler.payment_status(&order_no).await?;
    Ok(Json(status))
}
