//! Membership and plan endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use quillcheck_billing::SubscribeOutcome;
use quillcheck_shared::{MemberPlan, Membership, PayType};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn default_duration() -> i32 {
    1
}

#[derive(Deserialize)]
pub struct SubscribeRequest {
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub pay_type: PayType,
    #[serde(default = "default_duration")]
    pub duration: i32,
    #[serde(default)]
    pub auto_renew: bool,
}

/// Create a subscription order and return the payment URL
pub async fn subscribe(
    State(state): State<AppState>,
    Json(payload): Json<SubscribeRequest>,
) -> ApiResult<Json<SubscribeOutcome>> {
    let outcome = state
        .membership
        .subscribe(
            payload.user_id,
            payload.plan_id,
            payload.pay_type,
            payload.duration,
            payload.auto_renew,
        )
        .await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
pub struct UpgradeRequest {
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub pay_type: PayType,
}

/// Create a prorated upgrade order and return the payment URL
pub async fn upgrade(
    State(state): State<AppState>,
    Json(payload): Json<UpgradeRequest>,
) -> ApiResult<Json<SubscribeOutcome>> {
    let outcome = state
        .membership
        .create_upgrade_order(payload.user_id, payload.plan_id, payload.pay_type)
        .await?;
    Ok(Json(outcome))
}

/// The user's membership, if any
pub async fn membership(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<Membership>> {
    let membership = state
        .membership
        .membership(user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no membership for user {}", user_id)))?;
    Ok(Json(membership))
}

/// Purchasable plans
pub async fn plans(State(state): State<AppState>) -> ApiResult<Json<Vec<MemberPlan>>> {
    let plans = state.catalog.active_plans().await?;
    Ok(Json(plans))
}
