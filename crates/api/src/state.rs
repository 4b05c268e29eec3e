//! Shared application state

use quillcheck_billing::{
    HttpGateway, MembershipManager, OrderService, PaymentReconciler, PlanCatalog, QuotaLedger,
    StatusCache,
};
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state, cloned per request
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub catalog: PlanCatalog,
    pub ledger: QuotaLedger,
    pub orders: OrderService,
    pub membership: MembershipManager<HttpGateway>,
    pub reconciler: PaymentReconciler,
}

impl AppState {
    pub fn new(config: &Config, pool: PgPool, status_cache: Option<StatusCache>) -> Self {
        let catalog = PlanCatalog::new(pool.clone());
        let ledger = QuotaLedger::new(pool.clone());
        let orders = OrderService::new(pool.clone(), config.order_ttl_minutes);
        let gateway = HttpGateway::new(config.gateway_config());
        let membership = MembershipManager::new(
            pool.clone(),
            catalog.clone(),
            orders.clone(),
            gateway,
        );
        let reconciler = PaymentReconciler::new(
            pool.clone(),
            orders.clone(),
            config.gateway_secret.clone(),
            status_cache,
        );

        Self {
            pool,
            catalog,
            ledger,
            orders,
            membership,
            reconciler,
        }
    }
}
