//! Payment reconciliation
//!
//! Applies a payment gateway's outcome to internal order/membership/quota
//! state exactly once. The callback path and the manual completion path
//! converge on one settle function: a single transaction that marks the order
//! paid, upserts the membership, grants quota for both types, and records the
//! reconciliation outcome. The guarded order update inside that transaction
//! is what makes replayed callbacks no-ops instead of double grants.

use quillcheck_shared::{
    EffectiveOrderStatus, MemberPlan, Order, OrderStatus, PaymentRecord, QuotaChangeType,
    QuotaType,
};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{GatewayCallback, TradeStatus};
use crate::ledger::QuotaLedger;
use crate::orders::{self, OrderService};

/// Outcome of reconciling one callback or completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReconciliationResult {
    /// The order was settled by this invocation
    Settled {
        order_no: String,
        #[serde(with = "time::serde::rfc3339")]
        membership_expire: OffsetDateTime,
    },
    /// The order had already been settled; no side effects were applied
    AlreadySettled { order_no: String },
    /// The gateway reported a failure; the order stays pending so a retry
    /// within the TTL can still succeed
    Failed { order_no: String, reason: String },
}

/// Payment status as reported to polling callers
#[derive(Debug, Clone, Serialize)]
pub struct PaymentStatus {
    pub status: EffectiveOrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Bounded-TTL cache of reconciliation outcomes so status polling does not
/// re-verify against the store. Best effort: cache failures are logged, never
/// surfaced.
#[derive(Clone)]
pub struct StatusCache {
    conn: ConnectionManager,
    ttl_secs: u64,
}

impl StatusCache {
    /// Connect at startup; the manager reconnects on its own afterwards
    pub async fn connect(redis_url: &str, ttl_secs: u64) -> BillingResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BillingError::Config(format!("invalid redis url: {}", e)))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| BillingError::Transient(format!("redis unavailable: {}", e)))?;
        Ok(Self { conn, ttl_secs })
    }

    fn key(order_no: &str) -> String {
        format!("quillcheck:reconcile:{}", order_no)
    }

    async fn put(&self, order_no: &str, result: &ReconciliationResult) {
        let payload = match serde_json::to_string(result) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(order_no = %order_no, error = %e, "failed to encode cached outcome");
                return;
            }
        };
        let mut conn = self.conn.clone();
        let stored: redis::RedisResult<()> =
            conn.set_ex(Self::key(order_no), payload, self.ttl_secs).await;
        if let Err(e) = stored {
            tracing::warn!(order_no = %order_no, error = %e, "failed to cache reconciliation outcome");
        }
    }

    async fn get(&self, order_no: &str) -> Option<ReconciliationResult> {
        let mut conn = self.conn.clone();
        let cached: redis::RedisResult<Option<String>> = conn.get(Self::key(order_no)).await;
        match cached {
            Ok(Some(payload)) => serde_json::from_str(&payload).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(order_no = %order_no, error = %e, "status cache read failed");
                None
            }
        }
    }
}

/// Payment reconciler: the only writer of payment records and the only
/// caller allowed to drive an order to PAID.
#[derive(Clone)]
pub struct PaymentReconciler {
    pool: PgPool,
    orders: OrderService,
    secret: String,
    cache: Option<StatusCache>,
}

impl PaymentReconciler {
    pub fn new(pool: PgPool, orders: OrderService, secret: String, cache: Option<StatusCache>) -> Self {
        Self {
            pool,
            orders,
            secret,
            cache,
        }
    }

    /// Reconcile an asynchronous gateway callback
    pub async fn handle_callback(
        &self,
        callback: &GatewayCallback,
    ) -> BillingResult<ReconciliationResult> {
        // Authenticity first: nothing is read or written on a bad signature.
        // The payload is logged in full for audit.
        if !callback.verify(&self.secret) {
            tracing::warn!(
                order_no = %callback.order_id,
                payload = %serde_json::to_string(callback).unwrap_or_default(),
                "callback signature verification failed"
            );
            return Err(BillingError::InvalidSignature);
        }

        let order = self
            .orders
            .by_order_no(&callback.order_id)
            .await?
            .ok_or_else(|| BillingError::OrderNotFound(callback.order_id.clone()))?;

        // Replayed callback for a settled order: answer without side effects
        if order.status == OrderStatus::Paid {
            tracing::info!(order_no = %order.order_no, "replayed callback for settled order");
            return Ok(ReconciliationResult::AlreadySettled {
                order_no: order.order_no,
            });
        }

        let raw_payload = serde_json::to_value(callback)
            .map_err(|e| BillingError::InvalidInput(format!("unserializable payload: {}", e)))?;

        match callback.trade_status {
            TradeStatus::Failed => {
                // Non-final failure: the order stays pending within its TTL
                self.record_outcome(order.id, &callback.trade_no, &raw_payload, "failed")
                    .await?;
                tracing::info!(
                    order_no = %order.order_no,
                    trade_no = %callback.trade_no,
                    "gateway reported payment failure"
                );
                Ok(ReconciliationResult::Failed {
                    order_no: order.order_no,
                    reason: "gateway reported failure".to_string(),
                })
            }
            TradeStatus::Success => {
                self.settle(&order, &callback.trade_no, raw_payload).await
            }
        }
    }

    /// Manual/test completion. Converges on the same settle function and
    /// idempotency guard as the callback path.
    pub async fn complete_payment(&self, order_id: Uuid) -> BillingResult<ReconciliationResult> {
        let order = self
            .orders
            .by_id(order_id)
            .await?
            .ok_or_else(|| BillingError::OrderNotFound(order_id.to_string()))?;

        if order.status == OrderStatus::Paid {
            return Ok(ReconciliationResult::AlreadySettled {
                order_no: order.order_no,
            });
        }

        let trade_no = format!("manual-{}", order.id);
        let raw_payload = serde_json::json!({ "source": "manual_completion" });
        self.settle(&order, &trade_no, raw_payload).await
    }

    /// Status for polling clients, answered from the outcome cache when warm
    pub async fn payment_status(&self, order_no: &str) -> BillingResult<PaymentStatus> {
        if let Some(cache) = &self.cache {
            if let Some(result) = cache.get(order_no).await {
                return Ok(match result {
                    ReconciliationResult::Settled { .. }
                    | ReconciliationResult::AlreadySettled { .. } => PaymentStatus {
                        status: EffectiveOrderStatus::Paid,
                        message: None,
                    },
                    ReconciliationResult::Failed { reason, .. } => PaymentStatus {
                        status: EffectiveOrderStatus::Pending,
                        message: Some(reason),
                    },
                });
            }
        }

        let order = self
            .orders
            .by_order_no(order_no)
            .await?
            .ok_or_else(|| BillingError::OrderNotFound(order_no.to_string()))?;

        let status = order.effective_status(OffsetDateTime::now_utc());
        let message = if status == EffectiveOrderStatus::Pending {
            self.payment_record(order.id)
                .await?
                .filter(|r| r.outcome == "failed")
                .map(|_| "gateway reported failure".to_string())
        } else {
            None
        };
        Ok(PaymentStatus { status, message })
    }

    /// The single atomic transition: order -> PAID, membership upsert, quota
    /// grants for both types, payment record. All of it commits or none of it
    /// does; a half-applied settle is the failure mode this function exists
    /// to prevent.
    async fn settle(
        &self,
        order: &Order,
        trade_no: &str,
        raw_payload: serde_json::Value,
    ) -> BillingResult<ReconciliationResult> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        match orders::mark_paid_on(&mut tx, order, now).await {
            Ok(()) => {}
            // A concurrent settle won; treat like a replay, not an error
            Err(BillingError::OrderAlreadyPaid(order_no)) => {
                tx.rollback().await?;
                return Ok(ReconciliationResult::AlreadySettled { order_no });
            }
            Err(e) => return Err(e),
        }

        let plan: MemberPlan = sqlx::query_as(
            "SELECT id, name, level, period_type, price_cents, detection_quota,
                    rewrite_quota, active, created_at
             FROM member_plans WHERE id = $1",
        )
        .bind(order.plan_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(BillingError::PlanNotFound(order.plan_id))?;

        let expire_time = now + order.granted_period(plan.period_type);

        sqlx::query(
            "INSERT INTO memberships (user_id, plan_id, status, start_time, expire_time, auto_renew)
             VALUES ($1, $2, 'normal', $3, $4, $5)
             ON CONFLICT (user_id) DO UPDATE SET
                 plan_id = EXCLUDED.plan_id,
                 status = 'normal',
                 start_time = EXCLUDED.start_time,
                 expire_time = EXCLUDED.expire_time,
                 auto_renew = EXCLUDED.auto_renew,
                 updated_at = NOW()",
        )
        .bind(order.user_id)
        .bind(plan.id)
        .bind(now)
        .bind(expire_time)
        .bind(order.auto_renew)
        .execute(&mut *tx)
        .await?;

        let grants = [
            (QuotaType::Detection, plan.detection_quota),
            (QuotaType::Rewrite, plan.rewrite_quota),
        ];
        for (quota_type, per_period) in grants {
            let amount = per_period * order.duration as i64;
            if amount == 0 {
                continue;
            }
            QuotaLedger::grant_on(
                &mut tx,
                order.user_id,
                quota_type,
                QuotaChangeType::Recharge,
                amount,
                Some(order.id),
                Some(expire_time),
                "plan purchase",
            )
            .await?;
        }

        sqlx::query(
            "INSERT INTO payment_records (order_id, trade_no, raw_payload, outcome)
             VALUES ($1, $2, $3, 'success')
             ON CONFLICT (order_id) DO UPDATE SET
                 trade_no = EXCLUDED.trade_no,
                 raw_payload = EXCLUDED.raw_payload,
                 outcome = 'success',
                 updated_at = NOW()",
        )
        .bind(order.id)
        .bind(trade_no)
        .bind(&raw_payload)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            order_no = %order.order_no,
            user_id = %order.user_id,
            plan_id = %plan.id,
            trade_no = %trade_no,
            membership_expire = %expire_time,
            "order settled"
        );

        let result = ReconciliationResult::Settled {
            order_no: order.order_no.clone(),
            membership_expire: expire_time,
        };
        if let Some(cache) = &self.cache {
            cache.put(&order.order_no, &result).await;
        }
        Ok(result)
    }

    /// Record a non-success reconciliation outcome for audit and polling
    async fn record_outcome(
        &self,
        order_id: Uuid,
        trade_no: &str,
        raw_payload: &serde_json::Value,
        outcome: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            "INSERT INTO payment_records (order_id, trade_no, raw_payload, outcome)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (order_id) DO UPDATE SET
                 trade_no = EXCLUDED.trade_no,
                 raw_payload = EXCLUDED.raw_payload,
                 outcome = EXCLUDED.outcome,
                 updated_at = NOW()",
        )
        .bind(order_id)
        .bind(trade_no)
        .bind(raw_payload)
        .bind(outcome)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn payment_record(&self, order_id: Uuid) -> BillingResult<Option<PaymentRecord>> {
        let record = sqlx::query_as(
            "SELECT id, order_id, trade_no, raw_payload, outcome, created_at, updated_at
             FROM payment_records WHERE order_id = $1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }
}
