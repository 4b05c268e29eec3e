//! Purchase order lifecycle
//!
//! Orders are created PENDING with a bounded TTL and move to PAID only
//! through the payment reconciler. A pending order past its TTL reads as
//! expired; the row is never rewritten for that. Cancellation and refund are
//! administrative transitions off the hot path.

use quillcheck_shared::{MemberPlan, Order, OrderStatus, PayType};
use rand::Rng;
use sqlx::{PgConnection, PgPool};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Default TTL for a pending order
pub const DEFAULT_PENDING_TTL_MINUTES: i64 = 30;

/// Attempts at generating a unique order_no before giving up
const ORDER_NO_MAX_ATTEMPTS: usize = 3;

const ORDER_COLUMNS: &str = "id, order_no, user_id, plan_id, amount_cents, status, pay_type, \
                             duration, auto_renew, expire_time, created_at, updated_at";

/// Human-readable order number: UTC second timestamp plus a random suffix.
/// Uniqueness is ultimately enforced by the store's unique constraint.
fn generate_order_no(now: OffsetDateTime, suffix: u32) -> String {
    format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}{:06}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        suffix % 1_000_000
    )
}

/// Validation for the PENDING -> PAID transition, mirrored by the guarded
/// UPDATE in [`mark_paid_on`]
pub fn validate_paid_transition(
    order_no: &str,
    status: OrderStatus,
    expire_time: OffsetDateTime,
    now: OffsetDateTime,
) -> BillingResult<()> {
    match status {
        OrderStatus::Paid => Err(BillingError::OrderAlreadyPaid(order_no.to_string())),
        OrderStatus::Pending if now > expire_time => {
            Err(BillingError::OrderExpired(order_no.to_string()))
        }
        OrderStatus::Pending => Ok(()),
        other => Err(BillingError::InvalidOrderState(format!(
            "{}: cannot pay an order in state {:?}",
            order_no, other
        ))),
    }
}

/// Order store and state machine
#[derive(Clone)]
pub struct OrderService {
    pool: PgPool,
    pending_ttl: Duration,
}

impl OrderService {
    pub fn new(pool: PgPool, pending_ttl_minutes: i64) -> Self {
        Self {
            pool,
            pending_ttl: Duration::minutes(pending_ttl_minutes),
        }
    }

    /// Create a PENDING order. Retries order_no generation when the unique
    /// constraint rejects a colliding number.
    pub async fn create(
        &self,
        user_id: Uuid,
        plan: &MemberPlan,
        amount_cents: i64,
        pay_type: PayType,
        duration: i32,
        auto_renew: bool,
    ) -> BillingResult<Order> {
        let now = OffsetDateTime::now_utc();
        let expire_time = now + self.pending_ttl;

        for _ in 0..ORDER_NO_MAX_ATTEMPTS {
            let order_no = generate_order_no(now, rand::thread_rng().gen_range(0..1_000_000));
            let inserted = sqlx::query_as::<_, Order>(&format!(
                "INSERT INTO orders (order_no, user_id, plan_id, amount_cents, pay_type,
                                     duration, auto_renew, expire_time)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 RETURNING {ORDER_COLUMNS}"
            ))
            .bind(&order_no)
            .bind(user_id)
            .bind(plan.id)
            .bind(amount_cents)
            .bind(pay_type)
            .bind(duration)
            .bind(auto_renew)
            .bind(expire_time)
            .fetch_one(&self.pool)
            .await;

            match inserted {
                Ok(order) => {
                    tracing::info!(
                        order_no = %order.order_no,
                        user_id = %user_id,
                        plan_id = %plan.id,
                        amount_cents = amount_cents,
                        "order created"
                    );
                    return Ok(order);
                }
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                    tracing::warn!(order_no = %order_no, "order_no collision, regenerating");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(BillingError::Conflict(
            "could not generate a unique order number".to_string(),
        ))
    }

    pub async fn by_id(&self, id: Uuid) -> BillingResult<Option<Order>> {
        let order = sqlx::query_as(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(order)
    }

    pub async fn by_order_no(&self, order_no: &str) -> BillingResult<Option<Order>> {
        let order = sqlx::query_as(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE order_no = $1"
        ))
        .bind(order_no)
        .fetch_optional(&self.pool)
        .await?;
        Ok(order)
    }

    /// Administrative cancellation of a pending order
    pub async fn cancel(&self, order_id: Uuid) -> BillingResult<Order> {
        self.admin_transition(order_id, OrderStatus::Pending, OrderStatus::Cancelled)
            .await
    }

    /// Administrative refund of a paid order. Quota clawback is a separate
    /// ledger refund decision, not implied here.
    pub async fn refund(&self, order_id: Uuid) -> BillingResult<Order> {
        self.admin_transition(order_id, OrderStatus::Paid, OrderStatus::Refunded)
            .await
    }

    async fn admin_transition(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
    ) -> BillingResult<Order> {
        let updated: Option<Order> = sqlx::query_as(&format!(
            "UPDATE orders SET status = $3, updated_at = NOW()
             WHERE id = $1 AND status = $2
             RETURNING {ORDER_COLUMNS}"
        ))
        .bind(order_id)
        .bind(from)
        .bind(to)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(order) => {
                tracing::info!(order_no = %order.order_no, status = ?to, "order transitioned");
                Ok(order)
            }
            None => {
                let current = self.by_id(order_id).await?;
                match current {
                    None => Err(BillingError::OrderNotFound(order_id.to_string())),
                    Some(order) => Err(BillingError::InvalidOrderState(format!(
                        "{}: cannot move {:?} -> {:?}",
                        order.order_no, order.status, to
                    ))),
                }
            }
        }
    }
}

/// Guarded PENDING -> PAID transition inside the reconciler's transaction.
/// The single UPDATE is the idempotency and expiry guard; when it affects no
/// row the current state is re-read to name the exact failure.
pub(crate) async fn mark_paid_on(
    conn: &mut PgConnection,
    order: &Order,
    now: OffsetDateTime,
) -> BillingResult<()> {
    let result = sqlx::query(
        "UPDATE orders SET status = 'paid', updated_at = NOW()
         WHERE id = $1 AND status = 'pending' AND expire_time > $2",
    )
    .bind(order.id)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 1 {
        return Ok(());
    }

    let current: Option<(OrderStatus, OffsetDateTime)> =
        sqlx::query_as("SELECT status, expire_time FROM orders WHERE id = $1")
            .bind(order.id)
            .fetch_optional(&mut *conn)
            .await?;

    match current {
        None => Err(BillingError::OrderNotFound(order.order_no.clone())),
        Some((status, expire_time)) => {
            validate_paid_transition(&order.order_no, status, expire_time, now)?;
            // Guard failed but validation passes: another writer raced us
            Err(BillingError::Conflict(format!(
                "order {} changed concurrently",
                order.order_no
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_no_is_timestamp_plus_suffix() {
        let now = time::macros::datetime!(2025-01-01 12:00:00 UTC);
        assert_eq!(generate_order_no(now, 123_456), "20250101120000123456");
        assert_eq!(generate_order_no(now, 7), "20250101120000000007");
        // Suffix wraps into six digits
        assert_eq!(generate_order_no(now, 1_234_567), "20250101120000234567");
    }

    #[test]
    fn pending_order_within_ttl_may_be_paid() {
        let now = OffsetDateTime::now_utc();
        let expires = now + Duration::minutes(30);
        assert!(validate_paid_transition("o1", OrderStatus::Pending, expires, now).is_ok());
    }

    #[test]
    fn paid_order_rejects_a_second_payment() {
        let now = OffsetDateTime::now_utc();
        assert!(matches!(
            validate_paid_transition("o1", OrderStatus::Paid, now + Duration::minutes(30), now),
            Err(BillingError::OrderAlreadyPaid(_))
        ));
    }

    #[test]
    fn pending_order_past_ttl_rejects_payment() {
        // Callback arriving one minute past the 30-minute TTL
        let created = OffsetDateTime::now_utc() - Duration::minutes(31);
        let expires = created + Duration::minutes(30);
        let now = OffsetDateTime::now_utc();
        assert!(matches!(
            validate_paid_transition("o1", OrderStatus::Pending, expires, now),
            Err(BillingError::OrderExpired(_))
        ));
    }

    #[test]
    fn terminal_states_reject_payment() {
        let now = OffsetDateTime::now_utc();
        let expires = now + Duration::minutes(30);
        for status in [OrderStatus::Cancelled, OrderStatus::Refunded] {
            assert!(matches!(
                validate_paid_transition("o1", status, expires, now),
                Err(BillingError::InvalidOrderState(_))
            ));
        }
    }
}
