//! Common types used across Quillcheck

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Billing period of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "period_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    Monthly,
    Yearly,
}

impl PeriodType {
    /// Days of membership granted per purchased period.
    /// Proration never uses these; it derives day counts from the
    /// stored period dates.
    pub fn days(&self) -> i64 {
        match self {
            PeriodType::Monthly => 30,
            PeriodType::Yearly => 365,
        }
    }
}

/// Membership lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "membership_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MembershipStatus {
    Normal,
    Expired,
    Cancelled,
}

/// Metered quota types a user can purchase and consume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "quota_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QuotaType {
    Detection,
    Rewrite,
}

impl QuotaType {
    pub const ALL: [QuotaType; 2] = [QuotaType::Detection, QuotaType::Rewrite];

    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaType::Detection => "detection",
            QuotaType::Rewrite => "rewrite",
        }
    }
}

impl std::fmt::Display for QuotaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of entry in the append-only quota ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "quota_change_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QuotaChangeType {
    Consume,
    Recharge,
    Expire,
    Refund,
}

/// Stored order status. A pending order past its expiry is reported as
/// expired at read time, never written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Cancelled,
    Refunded,
}

/// Order status as seen by callers, including the derived expired state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectiveOrderStatus {
    Pending,
    Paid,
    Cancelled,
    Refunded,
    Expired,
}

/// Supported payment channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "pay_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PayType {
    Wechat,
    Alipay,
}

impl PayType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayType::Wechat => "wechat",
            PayType::Alipay => "alipay",
        }
    }
}

// =============================================================================
// Rows
// =============================================================================

/// Immutable plan catalog entry
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MemberPlan {
    pub id: Uuid,
    pub name: String,
    /// Ordinal tier; higher means a bigger plan within the same period type
    pub level: i32,
    pub period_type: PeriodType,
    pub price_cents: i64,
    pub detection_quota: i64,
    pub rewrite_quota: i64,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A user's membership. One row per user.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Membership {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub status: MembershipStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expire_time: OffsetDateTime,
    pub auto_renew: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Membership {
    /// A membership that is NORMAL and not yet past its expiry
    pub fn is_live(&self, now: OffsetDateTime) -> bool {
        self.status == MembershipStatus::Normal && self.expire_time > now
    }
}

/// Per-user, per-type quota balance
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserQuota {
    pub user_id: Uuid,
    pub quota_type: QuotaType,
    pub total_quota: i64,
    pub used_quota: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expire_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl UserQuota {
    pub fn remaining(&self) -> i64 {
        self.total_quota - self.used_quota
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expire_time.map(|t| t < now).unwrap_or(false)
    }
}

/// Append-only quota ledger entry. For consume/expire the before/after
/// amounts snapshot used_quota; for recharge/refund they snapshot
/// total_quota.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QuotaRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub quota_type: QuotaType,
    pub change_type: QuotaChangeType,
    pub change_amount: i64,
    pub before_amount: i64,
    pub after_amount: i64,
    pub order_id: Option<Uuid>,
    pub remark: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A purchase order
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: Uuid,
    pub order_no: String,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub amount_cents: i64,
    pub status: OrderStatus,
    pub pay_type: PayType,
    /// Number of plan periods purchased
    pub duration: i32,
    pub auto_renew: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub expire_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Order {
    /// Stored status plus the derived expired state for stale pending orders
    pub fn effective_status(&self, now: OffsetDateTime) -> EffectiveOrderStatus {
        match self.status {
            OrderStatus::Pending if now > self.expire_time => EffectiveOrderStatus::Expired,
            OrderStatus::Pending => EffectiveOrderStatus::Pending,
            OrderStatus::Paid => EffectiveOrderStatus::Paid,
            OrderStatus::Cancelled => EffectiveOrderStatus::Cancelled,
            OrderStatus::Refunded => EffectiveOrderStatus::Refunded,
        }
    }

    /// Membership time granted when this order settles
    pub fn granted_period(&self, period_type: PeriodType) -> Duration {
        Duration::days(period_type.days() * self.duration as i64)
    }
}

/// Reconciliation outcome for an order, written only by the payment
/// reconciler. The unique order_id key makes callback replays idempotent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub order_id: Uuid,
    pub trade_no: String,
    pub raw_payload: serde_json::Value,
    pub outcome: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(status: OrderStatus, expires_in_minutes: i64) -> Order {
        let now = OffsetDateTime::now_utc();
        Order {
            id: Uuid::new_v4(),
            order_no: "20250101120000123456".to_string(),
            user_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            amount_cents: 9900,
            status,
            pay_type: PayType::Alipay,
            duration: 1,
            auto_renew: false,
            expire_time: now + Duration::minutes(expires_in_minutes),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn pending_order_past_expiry_reads_as_expired() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            order(OrderStatus::Pending, -1).effective_status(now),
            EffectiveOrderStatus::Expired
        );
        assert_eq!(
            order(OrderStatus::Pending, 30).effective_status(now),
            EffectiveOrderStatus::Pending
        );
    }

    #[test]
    fn paid_order_never_reads_as_expired() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            order(OrderStatus::Paid, -60).effective_status(now),
            EffectiveOrderStatus::Paid
        );
    }

    #[test]
    fn granted_period_scales_with_duration() {
        let mut o = order(OrderStatus::Pending, 30);
        o.duration = 3;
        assert_eq!(o.granted_period(PeriodType::Monthly), Duration::days(90));
        assert_eq!(
            order(OrderStatus::Pending, 30).granted_period(PeriodType::Yearly),
            Duration::days(365)
        );
    }

    #[test]
    fn quota_remaining_and_expiry() {
        let now = OffsetDateTime::now_utc();
        let q = UserQuota {
            user_id: Uuid::new_v4(),
            quota_type: QuotaType::Detection,
            total_quota: 100,
            used_quota: 40,
            expire_time: Some(now - Duration::days(1)),
            created_at: now,
            updated_at: now,
        };
        assert_eq!(q.remaining(), 60);
        assert!(q.is_expired(now));
    }
}
