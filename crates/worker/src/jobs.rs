//! Periodic maintenance jobs
//!
//! Memberships and quotas expire lazily on read; these sweeps catch rows
//! nobody reads so reporting and the ledger stay consistent. Both jobs are
//! idempotent and safe to run concurrently with the API.

use quillcheck_billing::QuotaLedger;
use quillcheck_shared::{QuotaType, UserQuota};
use sqlx::PgPool;
use tracing::{error, info};
use uuid::Uuid;

/// Rows per sweep pass, so one pass never holds the pool for long
const SWEEP_BATCH_SIZE: i64 = 500;

/// Flip NORMAL memberships past their expiry to EXPIRED
pub async fn sweep_expired_memberships(pool: &PgPool) {
    let result = sqlx::query(
        "UPDATE memberships SET status = 'expired', updated_at = NOW()
         WHERE status = 'normal' AND expire_time <= NOW()",
    )
    .execute(pool)
    .await;

    match result {
        Ok(r) if r.rows_affected() > 0 => {
            info!(count = r.rows_affected(), "memberships swept to expired");
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "membership sweep failed"),
    }
}

/// Write EXPIRE ledger entries for balances whose expiry has passed with
/// credits still unused. Each lapse goes through the ledger so the record
/// trail stays complete.
pub async fn lapse_expired_quotas(pool: &PgPool, ledger: &QuotaLedger) {
    let stale: Vec<UserQuota> = match sqlx::query_as(
        "SELECT user_id, quota_type, total_quota, used_quota, expire_time, created_at, updated_at
         FROM user_quotas
         WHERE expire_time < NOW() AND used_quota < total_quota
         ORDER BY expire_time ASC
         LIMIT $1",
    )
    .bind(SWEEP_BATCH_SIZE)
    .fetch_all(pool)
    .await
    {
        Ok(rows) => rows,
        Err(e) => {
            error!(error = %e, "failed to list expired quota balances");
            return;
        }
    };

    if stale.is_empty() {
        return;
    }

    info!(count = stale.len(), "lapsing expired quota balances");
    for quota in stale {
        lapse_one(ledger, quota.user_id, quota.quota_type, quota.remaining()).await;
    }
}

async fn lapse_one(ledger: &QuotaLedger, user_id: Uuid, quota_type: QuotaType, remaining: i64) {
    match ledger.expire(user_id, quota_type, remaining).await {
        Ok(lapsed) if lapsed > 0 => {
            info!(
                user_id = %user_id,
                quota_type = %quota_type,
                lapsed = lapsed,
                "quota lapsed"
            );
        }
        // A concurrent consume may have drained it first
        Ok(_) => {}
        Err(e) => {
            error!(
                user_id = %user_id,
                quota_type = %quota_type,
                error = %e,
                "quota lapse failed, will retry next sweep"
            );
        }
    }
}
