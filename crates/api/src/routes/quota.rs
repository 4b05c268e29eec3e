//! Quota endpoints

use axum::{
    extract::{Path, Query, State},
    Json,
};
use quillcheck_shared::{QuotaRecord, QuotaType, UserQuota};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ConsumeRequest {
    pub user_id: Uuid,
    pub quota_type: QuotaType,
    pub amount: i64,
    #[serde(default)]
    pub remark: Option<String>,
}

#[derive(Serialize)]
pub struct ConsumeResponse {
    pub success: bool,
    pub remaining: i64,
}

/// Consume quota credits for a user
pub async fn consume(
    State(state): State<AppState>,
    Json(payload): Json<ConsumeRequest>,
) -> ApiResult<Json<ConsumeResponse>> {
    let remark = payload.remark.as_deref().unwrap_or("api consume");
    let remaining = state
        .ledger
        .consume(payload.user_id, payload.quota_type, payload.amount, remark)
        .await?;
    Ok(Json(ConsumeResponse {
        success: true,
        remaining,
    }))
}

#[derive(Serialize)]
pub struct BalancesResponse {
    pub user_id: Uuid,
    pub balances: Vec<UserQuota>,
}

/// All quota balances for a user
pub async fn balances(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<BalancesResponse>> {
    let balances = state.ledger.balances(user_id).await?;
    Ok(Json(BalancesResponse { user_id, balances }))
}

#[derive(Deserialize)]
pub struct RecordsQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// Recent quota ledger entries for a user, newest first
pub async fn records(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<RecordsQuery>,
) -> ApiResult<Json<Vec<QuotaRecord>>> {
    let limit = query.limit.clamp(1, 200);
    let records = state.ledger.recent_records(user_id, limit).await?;
    Ok(Json(records))
}
