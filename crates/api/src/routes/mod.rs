//! API routes

pub mod health;
pub mod membership;
pub mod orders;
pub mod payment;
pub mod quota;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    let api_routes = Router::new()
        .route("/quota/consume", post(quota::consume))
        .route("/quota/:user_id", get(quota::balances))
        .route("/quota/:user_id/records", get(quota::records))
        .route("/membership/subscribe", post(membership::subscribe))
        .route("/membership/upgrade", post(membership::upgrade))
        .route("/membership/:user_id", get(membership::membership))
        .route("/plans", get(membership::plans))
        .route("/payment/callback", post(payment::callback))
        .route("/payment/complete", post(payment::complete))
        .route("/payment/status/:order_no", get(payment::status))
        .route("/orders/:order_id", get(orders::get))
        .route("/orders/:order_id/cancel", post(orders::cancel))
        .route("/orders/:order_id/refund", post(orders::refund));

    Router::new()
        .merge(health_routes)
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
