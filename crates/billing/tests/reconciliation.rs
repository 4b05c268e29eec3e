//! Integration tests for payment reconciliation
//!
//! These tests verify that gateway callbacks settle orders exactly once:
//! membership and quota grants are applied atomically, replays are answered
//! without side effects, and stale or failed callbacks leave state untouched.
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://..."
//! cargo test --test reconciliation -- --ignored --test-threads=1
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;

use quillcheck_billing::{
    gateway::sign_params, BillingError, GatewayCallback, OrderService, PaymentReconciler,
    QuotaLedger, ReconciliationResult, TradeStatus,
};
use quillcheck_shared::{
    db, MembershipStatus, Order, PayType, PeriodType, QuotaChangeType, QuotaType,
};
use sqlx::PgPool;
use uuid::Uuid;

const TEST_SECRET: &str = "integration-test-secret";

async fn setup_pool() -> PgPool {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
    let pool = db::create_pool(&database_url, 5)
        .await
        .expect("Failed to connect to test database");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

fn services(pool: &PgPool) -> (OrderService, PaymentReconciler, QuotaLedger) {
    let orders = OrderService::new(pool.clone(), 30);
    let reconciler = PaymentReconciler::new(
        pool.clone(),
        orders.clone(),
        TEST_SECRET.to_string(),
        None,
    );
    let ledger = QuotaLedger::new(pool.clone());
    (orders, reconciler, ledger)
}

/// Insert a monthly test plan and return its id
async fn create_test_plan(pool: &PgPool, detection: i64, rewrite: i64) -> Uuid {
    let plan_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO member_plans (id, name, level, period_type, price_cents,
                                   detection_quota, rewrite_quota, active)
         VALUES ($1, $2, 1, $3, 9900, $4, $5, true)",
    )
    .bind(plan_id)
    .bind(format!("test-plan-{}", plan_id))
    .bind(PeriodType::Monthly)
    .bind(detection)
    .bind(rewrite)
    .execute(pool)
    .await
    .expect("Failed to create test plan");
    plan_id
}

async fn create_test_order(pool: &PgPool, orders: &OrderService, plan_id: Uuid) -> Order {
    let plan = sqlx::query_as(
        "SELECT id, name, level, period_type, price_cents, detection_quota,
                rewrite_quota, active, created_at
         FROM member_plans WHERE id = $1",
    )
    .bind(plan_id)
    .fetch_one(pool)
    .await
    .expect("Failed to load test plan");
    orders
        .create(Uuid::new_v4(), &plan, 9900, PayType::Alipay, 1, false)
        .await
        .expect("Failed to create test order")
}

/// A correctly signed SUCCESS callback for the order
fn signed_callback(order: &Order, trade_status: TradeStatus) -> GatewayCallback {
    let mut params = BTreeMap::new();
    params.insert("order_id".to_string(), order.order_no.clone());
    params.insert("trade_no".to_string(), format!("TN-{}", order.order_no));
    params.insert(
        "trade_status".to_string(),
        match trade_status {
            TradeStatus::Success => "SUCCESS".to_string(),
            TradeStatus::Failed => "FAILED".to_string(),
        },
    );
    params.insert("amount".to_string(), order.amount_cents.to_string());
    let sign = sign_params(&params, TEST_SECRET);

    let mut extra = BTreeMap::new();
    extra.insert(
        "amount".to_string(),
        serde_json::Value::String(order.amount_cents.to_string()),
    );
    GatewayCallback {
        order_id: order.order_no.clone(),
        trade_no: format!("TN-{}", order.order_no),
        trade_status,
        sign,
        extra,
    }
}

#[tokio::test]
#[ignore] // Requires database
async fn callback_settles_order_and_replay_is_a_noop() {
    let pool = setup_pool().await;
    let (orders, reconciler, ledger) = services(&pool);
    let plan_id = create_test_plan(&pool, 100, 50).await;
    let order = create_test_order(&pool, &orders, plan_id).await;

    let callback = signed_callback(&order, TradeStatus::Success);
    let result = reconciler
        .handle_callback(&callback)
        .await
        .expect("First callback should settle");
    assert!(matches!(result, ReconciliationResult::Settled { .. }));

    // Replaying the identical callback answers without re-granting
    let replay = reconciler
        .handle_callback(&callback)
        .await
        .expect("Replay should be accepted");
    assert!(matches!(replay, ReconciliationResult::AlreadySettled { .. }));

    // Exactly one RECHARGE record per quota type for this order
    let records = ledger
        .records_for_order(order.id)
        .await
        .expect("Failed to load ledger records");
    assert_eq!(records.len(), 2);
    assert!(records
        .iter()
        .all(|r| r.change_type == QuotaChangeType::Recharge));
    let mut types: Vec<QuotaType> = records.iter().map(|r| r.quota_type).collect();
    types.sort_by_key(|t| t.as_str());
    assert_eq!(types, vec![QuotaType::Detection, QuotaType::Rewrite]);

    // Balances match the plan's per-period quotas
    let detection = ledger
        .balance(order.user_id, QuotaType::Detection)
        .await
        .expect("Failed to read balance")
        .expect("Detection balance should exist");
    assert_eq!(detection.total_quota, 100);
    assert_eq!(detection.used_quota, 0);

    // Membership is live
    let (status,): (MembershipStatus,) =
        sqlx::query_as("SELECT status FROM memberships WHERE user_id = $1")
            .bind(order.user_id)
            .fetch_one(&pool)
            .await
            .expect("Membership should exist");
    assert_eq!(status, MembershipStatus::Normal);
}

#[tokio::test]
#[ignore] // Requires database
async fn failed_callback_leaves_order_pending() {
    let pool = setup_pool().await;
    let (orders, reconciler, ledger) = services(&pool);
    let plan_id = create_test_plan(&pool, 100, 50).await;
    let order = create_test_order(&pool, &orders, plan_id).await;

    let callback = signed_callback(&order, TradeStatus::Failed);
    let result = reconciler
        .handle_callback(&callback)
        .await
        .expect("Failed callback should be recorded");
    assert!(matches!(result, ReconciliationResult::Failed { .. }));

    // Order is still pending and nothing was granted
    let current = orders
        .by_id(order.id)
        .await
        .expect("Failed to load order")
        .expect("Order should exist");
    assert_eq!(current.status, quillcheck_shared::OrderStatus::Pending);
    let records = ledger
        .records_for_order(order.id)
        .await
        .expect("Failed to load ledger records");
    assert!(records.is_empty());

    // A later success for the same order still settles it
    let success = signed_callback(&order, TradeStatus::Success);
    let result = reconciler
        .handle_callback(&success)
        .await
        .expect("Retry after failure should settle");
    assert!(matches!(result, ReconciliationResult::Settled { .. }));
}

#[tokio::test]
#[ignore] // Requires database
async fn callback_past_order_ttl_is_rejected() {
    let pool = setup_pool().await;
    let (orders, reconciler, _ledger) = services(&pool);
    let plan_id = create_test_plan(&pool, 100, 50).await;
    let order = create_test_order(&pool, &orders, plan_id).await;

    // Age the order past its 30-minute TTL
    sqlx::query("UPDATE orders SET expire_time = NOW() - INTERVAL '1 minute' WHERE id = $1")
        .bind(order.id)
        .execute(&pool)
        .await
        .expect("Failed to age order");

    let callback = signed_callback(&order, TradeStatus::Success);
    let err = reconciler
        .handle_callback(&callback)
        .await
        .expect_err("Stale order must not settle");
    assert!(matches!(err, BillingError::OrderExpired(_)));
}

#[tokio::test]
#[ignore] // Requires database
async fn tampered_callback_is_rejected_before_any_write() {
    let pool = setup_pool().await;
    let (orders, reconciler, ledger) = services(&pool);
    let plan_id = create_test_plan(&pool, 100, 50).await;
    let order = create_test_order(&pool, &orders, plan_id).await;

    let mut callback = signed_callback(&order, TradeStatus::Success);
    callback
        .extra
        .insert("amount".to_string(), serde_json::Value::String("1".to_string()));

    let err = reconciler
        .handle_callback(&callback)
        .await
        .expect_err("Tampered callback must be rejected");
    assert!(matches!(err, BillingError::InvalidSignature));

    let records = ledger
        .records_for_order(order.id)
        .await
        .expect("Failed to load ledger records");
    assert!(records.is_empty());
}

#[tokio::test]
#[ignore] // Requires database
async fn manual_completion_converges_with_callback_path() {
    let pool = setup_pool().await;
    let (orders, reconciler, ledger) = services(&pool);
    let plan_id = create_test_plan(&pool, 100, 50).await;
    let order = create_test_order(&pool, &orders, plan_id).await;

    let result = reconciler
        .complete_payment(order.id)
        .await
        .expect("Manual completion should settle");
    assert!(matches!(result, ReconciliationResult::Settled { .. }));

    // A gateway callback arriving afterwards is a replay
    let callback = signed_callback(&order, TradeStatus::Success);
    let replay = reconciler
        .handle_callback(&callback)
        .await
        .expect("Replay should be accepted");
    assert!(matches!(replay, ReconciliationResult::AlreadySettled { .. }));

    let records = ledger
        .records_for_order(order.id)
        .await
        .expect("Failed to load ledger records");
    assert_eq!(records.len(), 2);
}
