//! Quillcheck billing core
//!
//! Membership plans, purchase orders, payment reconciliation, and the
//! per-user quota ledger. The API and worker crates compose these services;
//! no HTTP or scheduling concerns live here.

pub mod catalog;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod membership;
pub mod orders;
pub mod proration;
pub mod reconcile;

pub use catalog::PlanCatalog;
pub use error::{BillingError, BillingResult};
pub use gateway::{GatewayCallback, GatewayConfig, HttpGateway, PaymentGateway, TradeStatus};
pub use ledger::QuotaLedger;
pub use membership::{MembershipManager, SubscribeOutcome};
pub use orders::{OrderService, DEFAULT_PENDING_TTL_MINUTES};
pub use proration::{price_for_change, CurrentPeriod};
pub use reconcile::{PaymentReconciler, PaymentStatus, ReconciliationResult, StatusCache};
