//! Plan catalog lookups, read-only to the billing core

use quillcheck_shared::MemberPlan;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

const PLAN_COLUMNS: &str = "id, name, level, period_type, price_cents, detection_quota, \
                            rewrite_quota, active, created_at";

#[derive(Clone)]
pub struct PlanCatalog {
    pool: PgPool,
}

impl PlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn plan(&self, id: Uuid) -> BillingResult<Option<MemberPlan>> {
        let plan = sqlx::query_as(&format!(
            "SELECT {PLAN_COLUMNS} FROM member_plans WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plan)
    }

    /// Purchasable plans ordered by period type and tier
    pub async fn active_plans(&self) -> BillingResult<Vec<MemberPlan>> {
        let plans = sqlx::query_as(&format!(
            "SELECT {PLAN_COLUMNS} FROM member_plans
             WHERE active = true ORDER BY period_type, level"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(plans)
    }
}
