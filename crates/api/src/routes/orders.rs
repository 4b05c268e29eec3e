//! Order administration endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use quillcheck_shared::{EffectiveOrderStatus, Order};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Serialize)]
pub struct OrderResponse {
    #[serde(flatten)]
    pub order: Order,
    pub effective_status: EffectiveOrderStatus,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        let effective_status = order.effective_status(OffsetDateTime::now_utc());
        Self {
            order,
            effective_status,
        }
    }
}

/// Fetch an order by id
pub async fn get(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<OrderResponse>> {
    let order = state
        .orders
        .by_id(order_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("order {} not found", order_id)))?;
    Ok(Json(order.into()))
}

/// Cancel a pending order
pub async fn cancel(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<OrderResponse>> {
    let order = state.orders.cancel(order_id).await?;
    Ok(Json(order.into()))
}

/// Refund a paid order
pub async fn refund(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<OrderResponse>> {
    let order = state.orders.refund(order_id).await?;
    Ok(Json(order.into()))
}
