//! Membership subscription and upgrade orchestration
//!
//! Ties the plan catalog, proration, order creation, and the payment gateway
//! together. Nothing here grants membership time or quota directly; that
//! happens only when the reconciler settles the order this module creates.

use quillcheck_shared::{MemberPlan, Membership, MembershipStatus, Order, PayType};
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::error::{BillingError, BillingResult};
use crate::gateway::PaymentGateway;
use crate::orders::OrderService;
use crate::proration::{is_valid_upgrade, price_for_change, CurrentPeriod};

/// A created order plus the gateway URL the user pays at
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeOutcome {
    pub order: Order,
    pub pay_url: String,
}

/// Membership orchestration service, generic over the payment channel
#[derive(Clone)]
pub struct MembershipManager<G: PaymentGateway> {
    pool: PgPool,
    catalog: PlanCatalog,
    orders: OrderService,
    gateway: G,
}

impl<G: PaymentGateway> MembershipManager<G> {
    pub fn new(pool: PgPool, catalog: PlanCatalog, orders: OrderService, gateway: G) -> Self {
        Self {
            pool,
            catalog,
            orders,
            gateway,
        }
    }

    /// Subscribe a user without a live membership to a plan. `duration` is
    /// the number of plan periods purchased.
    pub async fn subscribe(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        pay_type: PayType,
        duration: i32,
        auto_renew: bool,
    ) -> BillingResult<SubscribeOutcome> {
        if duration <= 0 {
            return Err(BillingError::InvalidInput(
                "duration must be at least one period".to_string(),
            ));
        }

        let plan = self.purchasable_plan(plan_id).await?;

        let now = OffsetDateTime::now_utc();
        if let Some(current) = self.membership(user_id).await? {
            if current.is_live(now) {
                return Err(BillingError::AlreadySubscribed(user_id));
            }
        }

        let amount_cents = plan.price_cents * duration as i64;
        self.place_order(user_id, &plan, amount_cents, pay_type, duration, auto_renew)
            .await
    }

    /// Create a prorated upgrade order for a user with a live membership.
    /// The unused value of the current period is credited against the target
    /// plan's price; the new period starts at settlement.
    pub async fn create_upgrade_order(
        &self,
        user_id: Uuid,
        target_plan_id: Uuid,
        pay_type: PayType,
    ) -> BillingResult<SubscribeOutcome> {
        let target = self.purchasable_plan(target_plan_id).await?;

        let now = OffsetDateTime::now_utc();
        let current = self
            .membership(user_id)
            .await?
            .filter(|m| m.is_live(now))
            .ok_or_else(|| {
                BillingError::InvalidUpgrade(format!("user {} has no live membership", user_id))
            })?;

        let current_plan = self
            .catalog
            .plan(current.plan_id)
            .await?
            .ok_or(BillingError::PlanNotFound(current.plan_id))?;
        is_valid_upgrade(&current_plan, &target)?;

        let period = CurrentPeriod {
            start: current.start_time,
            expire: current.expire_time,
        };
        let amount_cents = price_for_change(Some((&current_plan, period)), &target, now);

        tracing::info!(
            user_id = %user_id,
            from_plan = %current_plan.id,
            to_plan = %target.id,
            amount_cents = amount_cents,
            "prorated upgrade priced"
        );

        self.place_order(user_id, &target, amount_cents, pay_type, 1, current.auto_renew)
            .await
    }

    /// The user's membership with lazy expiry: a NORMAL row past its expiry
    /// is flipped to EXPIRED on read. The guarded update makes concurrent
    /// reads converge on the same row state.
    pub async fn membership(&self, user_id: Uuid) -> BillingResult<Option<Membership>> {
        let membership: Option<Membership> = sqlx::query_as(
            "SELECT id, user_id, plan_id, status, start_time, expire_time, auto_renew,
                    created_at, updated_at
             FROM memberships WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let membership = match membership {
            Some(m) => m,
            None => return Ok(None),
        };

        let now = OffsetDateTime::now_utc();
        if membership.status == MembershipStatus::Normal && membership.expire_time <= now {
            let updated: Option<Membership> = sqlx::query_as(
                "UPDATE memberships
                 SET status = 'expired', updated_at = NOW()
                 WHERE id = $1 AND status = 'normal' AND expire_time <= $2
                 RETURNING id, user_id, plan_id, status, start_time, expire_time, auto_renew,
                           created_at, updated_at",
            )
            .bind(membership.id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
            if updated.is_some() {
                tracing::info!(user_id = %user_id, "membership lapsed on read");
            }
            // A concurrent writer may have renewed it instead; re-read wins
            return match updated {
                Some(m) => Ok(Some(m)),
                None => self.membership_row(user_id).await,
            };
        }

        Ok(Some(membership))
    }

    async fn membership_row(&self, user_id: Uuid) -> BillingResult<Option<Membership>> {
        let membership = sqlx::query_as(
            "SELECT id, user_id, plan_id, status, start_time, expire_time, auto_renew,
                    created_at, updated_at
             FROM memberships WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(membership)
    }

    async fn purchasable_plan(&self, plan_id: Uuid) -> BillingResult<MemberPlan> {
        let plan = self
            .catalog
            .plan(plan_id)
            .await?
            .ok_or(BillingError::PlanNotFound(plan_id))?;
        if !plan.active {
            return Err(BillingError::InvalidInput(format!(
                "plan {} is not open for purchase",
                plan_id
            )));
        }
        Ok(plan)
    }

    async fn place_order(
        &self,
        user_id: Uuid,
        plan: &MemberPlan,
        amount_cents: i64,
        pay_type: PayType,
        duration: i32,
        auto_renew: bool,
    ) -> BillingResult<SubscribeOutcome> {
        let order = self
            .orders
            .create(user_id, plan, amount_cents, pay_type, duration, auto_renew)
            .await?;

        let pay_url = self
            .gateway
            .request_payment(&order.order_no, order.amount_cents, &plan.name, pay_type)
            .await?;

        Ok(SubscribeOutcome { order, pay_url })
    }
}
