//! Quota ledger
//!
//! Owns per-user, per-type quota balances and the append-only change log.
//! Every balance mutation is paired with exactly one quota record inside the
//! same transaction, so balances stay reconstructible from the records alone.
//!
//! Consume and expire serialize concurrent writers with a compare-and-swap on
//! `used_quota`: a lost swap is retried with jittered backoff and surfaced as
//! a transient failure once the retry budget runs out.

use quillcheck_shared::{QuotaChangeType, QuotaRecord, QuotaType, UserQuota};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Attempts per compare-and-swap mutation before giving up
const CAS_MAX_ATTEMPTS: usize = 3;

fn cas_backoff() -> impl Iterator<Item = std::time::Duration> {
    ExponentialBackoff::from_millis(10)
        .map(jitter)
        .take(CAS_MAX_ATTEMPTS - 1)
}

/// Bounds check for a consume attempt. The upper bound is a hard invariant:
/// `used_quota` may never exceed `total_quota`.
fn check_consume(total: i64, used: i64, amount: i64) -> BillingResult<()> {
    if used + amount > total {
        return Err(BillingError::InsufficientQuota {
            requested: amount,
            remaining: total - used,
        });
    }
    Ok(())
}

/// Quota ledger service
#[derive(Clone)]
pub struct QuotaLedger {
    pool: PgPool,
}

impl QuotaLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Consume `amount` credits. Returns the remaining balance.
    pub async fn consume(
        &self,
        user_id: Uuid,
        quota_type: QuotaType,
        amount: i64,
        remark: &str,
    ) -> BillingResult<i64> {
        if amount <= 0 {
            return Err(BillingError::InvalidInput(
                "consume amount must be positive".to_string(),
            ));
        }

        let mut backoff = cas_backoff();
        loop {
            if let Some(remaining) = self.try_consume_once(user_id, quota_type, amount, remark).await? {
                return Ok(remaining);
            }
            match backoff.next() {
                Some(delay) => {
                    tracing::debug!(
                        user_id = %user_id,
                        quota_type = %quota_type,
                        "consume lost the swap, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(BillingError::Transient(format!(
                        "quota update for user {} lost the race after {} attempts",
                        user_id, CAS_MAX_ATTEMPTS
                    )));
                }
            }
        }
    }

    /// One consume attempt. Ok(None) means the compare-and-swap lost.
    async fn try_consume_once(
        &self,
        user_id: Uuid,
        quota_type: QuotaType,
        amount: i64,
        remark: &str,
    ) -> BillingResult<Option<i64>> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        let quota: Option<UserQuota> = sqlx::query_as(
            "SELECT user_id, quota_type, total_quota, used_quota, expire_time, created_at, updated_at
             FROM user_quotas WHERE user_id = $1 AND quota_type = $2",
        )
        .bind(user_id)
        .bind(quota_type)
        .fetch_optional(&mut *tx)
        .await?;

        let quota = quota.ok_or(BillingError::QuotaNotFound { user_id, quota_type })?;
        if quota.is_expired(now) {
            return Err(BillingError::QuotaExpired(quota_type));
        }
        check_consume(quota.total_quota, quota.used_quota, amount)?;

        // Compare-and-swap on used_quota; a concurrent writer makes this a no-op
        let result = sqlx::query(
            "UPDATE user_quotas
             SET used_quota = used_quota + $3, updated_at = NOW()
             WHERE user_id = $1 AND quota_type = $2 AND used_quota = $4",
        )
        .bind(user_id)
        .bind(quota_type)
        .bind(amount)
        .bind(quota.used_quota)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        Self::append_record(
            &mut tx,
            user_id,
            quota_type,
            QuotaChangeType::Consume,
            amount,
            quota.used_quota,
            quota.used_quota + amount,
            None,
            Some(remark),
        )
        .await?;
        tx.commit().await?;

        let remaining = quota.total_quota - quota.used_quota - amount;
        tracing::info!(
            user_id = %user_id,
            quota_type = %quota_type,
            amount = amount,
            remaining = remaining,
            "quota consumed"
        );
        Ok(Some(remaining))
    }

    /// Grant purchased credits (RECHARGE)
    pub async fn grant(
        &self,
        user_id: Uuid,
        quota_type: QuotaType,
        amount: i64,
        order_id: Option<Uuid>,
        expire_time: Option<OffsetDateTime>,
        remark: &str,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::grant_on(
            &mut tx,
            user_id,
            quota_type,
            QuotaChangeType::Recharge,
            amount,
            order_id,
            expire_time,
            remark,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Return credits to a user (REFUND); increases total like a grant
    pub async fn refund(
        &self,
        user_id: Uuid,
        quota_type: QuotaType,
        amount: i64,
        order_id: Option<Uuid>,
        remark: &str,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::grant_on(
            &mut tx,
            user_id,
            quota_type,
            QuotaChangeType::Refund,
            amount,
            order_id,
            None,
            remark,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Transaction-scoped grant, used by the payment reconciler so quota
    /// grants commit or roll back together with the order transition.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn grant_on(
        conn: &mut PgConnection,
        user_id: Uuid,
        quota_type: QuotaType,
        change_type: QuotaChangeType,
        amount: i64,
        order_id: Option<Uuid>,
        expire_time: Option<OffsetDateTime>,
        remark: &str,
    ) -> BillingResult<()> {
        if amount <= 0 {
            return Err(BillingError::InvalidInput(
                "grant amount must be positive".to_string(),
            ));
        }
        if !matches!(change_type, QuotaChangeType::Recharge | QuotaChangeType::Refund) {
            return Err(BillingError::InvalidInput(
                "grants must be recharge or refund entries".to_string(),
            ));
        }

        // First-touch creation of a zeroed balance row
        sqlx::query(
            "INSERT INTO user_quotas (user_id, quota_type, total_quota, used_quota)
             VALUES ($1, $2, 0, 0)
             ON CONFLICT (user_id, quota_type) DO NOTHING",
        )
        .bind(user_id)
        .bind(quota_type)
        .execute(&mut *conn)
        .await?;

        let (total_after,): (i64,) = sqlx::query_as(
            "UPDATE user_quotas
             SET total_quota = total_quota + $3,
                 expire_time = CASE
                     WHEN $4::timestamptz IS NULL THEN expire_time
                     ELSE GREATEST(COALESCE(expire_time, $4), $4)
                 END,
                 updated_at = NOW()
             WHERE user_id = $1 AND quota_type = $2
             RETURNING total_quota",
        )
        .bind(user_id)
        .bind(quota_type)
        .bind(amount)
        .bind(expire_time)
        .fetch_one(&mut *conn)
        .await?;

        Self::append_record(
            conn,
            user_id,
            quota_type,
            change_type,
            amount,
            total_after - amount,
            total_after,
            order_id,
            Some(remark),
        )
        .await?;

        tracing::info!(
            user_id = %user_id,
            quota_type = %quota_type,
            change_type = ?change_type,
            amount = amount,
            total_after = total_after,
            "quota granted"
        );
        Ok(())
    }

    /// Mark unused quota as lapsed (EXPIRE): consumed without a consumption
    /// event. Capped so `used_quota` never exceeds `total_quota`. Returns the
    /// amount actually expired.
    pub async fn expire(
        &self,
        user_id: Uuid,
        quota_type: QuotaType,
        amount: i64,
    ) -> BillingResult<i64> {
        if amount <= 0 {
            return Err(BillingError::InvalidInput(
                "expire amount must be positive".to_string(),
            ));
        }

        let mut backoff = cas_backoff();
        loop {
            if let Some(expired) = self.try_expire_once(user_id, quota_type, amount).await? {
                return Ok(expired);
            }
            match backoff.next() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    return Err(BillingError::Transient(format!(
                        "quota expiry for user {} lost the race after {} attempts",
                        user_id, CAS_MAX_ATTEMPTS
                    )));
                }
            }
        }
    }

    async fn try_expire_once(
        &self,
        user_id: Uuid,
        quota_type: QuotaType,
        amount: i64,
    ) -> BillingResult<Option<i64>> {
        let mut tx = self.pool.begin().await?;

        let quota: Option<UserQuota> = sqlx::query_as(
            "SELECT user_id, quota_type, total_quota, used_quota, expire_time, created_at, updated_at
             FROM user_quotas WHERE user_id = $1 AND quota_type = $2",
        )
        .bind(user_id)
        .bind(quota_type)
        .fetch_optional(&mut *tx)
        .await?;

        let quota = match quota {
            Some(q) => q,
            None => return Ok(Some(0)),
        };
        let lapsed = amount.min(quota.remaining());
        if lapsed == 0 {
            return Ok(Some(0));
        }

        let result = sqlx::query(
            "UPDATE user_quotas
             SET used_quota = used_quota + $3, updated_at = NOW()
             WHERE user_id = $1 AND quota_type = $2 AND used_quota = $4",
        )
        .bind(user_id)
        .bind(quota_type)
        .bind(lapsed)
        .bind(quota.used_quota)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        Self::append_record(
            &mut tx,
            user_id,
            quota_type,
            QuotaChangeType::Expire,
            lapsed,
            quota.used_quota,
            quota.used_quota + lapsed,
            None,
            Some("quota lapsed unused"),
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            quota_type = %quota_type,
            lapsed = lapsed,
            "quota expired"
        );
        Ok(Some(lapsed))
    }

    /// Current balance for one quota type
    pub async fn balance(
        &self,
        user_id: Uuid,
        quota_type: QuotaType,
    ) -> BillingResult<Option<UserQuota>> {
        let quota = sqlx::query_as(
            "SELECT user_id, quota_type, total_quota, used_quota, expire_time, created_at, updated_at
             FROM user_quotas WHERE user_id = $1 AND quota_type = $2",
        )
        .bind(user_id)
        .bind(quota_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(quota)
    }

    /// All balances for a user
    pub async fn balances(&self, user_id: Uuid) -> BillingResult<Vec<UserQuota>> {
        let quotas = sqlx::query_as(
            "SELECT user_id, quota_type, total_quota, used_quota, expire_time, created_at, updated_at
             FROM user_quotas WHERE user_id = $1 ORDER BY quota_type",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(quotas)
    }

    /// Ledger entries attributed to an order, newest first
    pub async fn records_for_order(&self, order_id: Uuid) -> BillingResult<Vec<QuotaRecord>> {
        let records = sqlx::query_as(
            "SELECT id, user_id, quota_type, change_type, change_amount, before_amount,
                    after_amount, order_id, remark, created_at
             FROM quota_records WHERE order_id = $1 ORDER BY created_at DESC",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Recent ledger entries for a user
    pub async fn recent_records(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<QuotaRecord>> {
        let records = sqlx::query_as(
            "SELECT id, user_id, quota_type, change_type, change_amount, before_amount,
                    after_amount, order_id, remark, created_at
             FROM quota_records WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    #[allow(clippy::too_many_arguments)]
    async fn append_record(
        conn: &mut PgConnection,
        user_id: Uuid,
        quota_type: QuotaType,
        change_type: QuotaChangeType,
        change_amount: i64,
        before_amount: i64,
        after_amount: i64,
        order_id: Option<Uuid>,
        remark: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            "INSERT INTO quota_records (
                 user_id, quota_type, change_type, change_amount,
                 before_amount, after_amount, order_id, remark
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(user_id)
        .bind(quota_type)
        .bind(change_type)
        .bind(change_amount)
        .bind(before_amount)
        .bind(after_amount)
        .bind(order_id)
        .bind(remark)
        .execute(conn)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn consume_within_balance_is_allowed() {
        assert!(check_consume(100, 0, 100).is_ok());
        assert!(check_consume(100, 40, 60).is_ok());
        assert!(check_consume(100, 99, 1).is_ok());
    }

    #[test]
    fn consume_beyond_balance_reports_remaining() {
        let err = check_consume(100, 95, 10).unwrap_err();
        match err {
            BillingError::InsufficientQuota { requested, remaining } => {
                assert_eq!(requested, 10);
                assert_eq!(remaining, 5);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn used_quota_upper_bound_is_enforced() {
        // A fully drained balance rejects even the smallest consume
        assert!(check_consume(100, 100, 1).is_err());
    }

    #[test]
    fn cas_backoff_fits_retry_budget() {
        assert_eq!(cas_backoff().count(), CAS_MAX_ATTEMPTS - 1);
    }
}
