//! Quillcheck maintenance worker
//!
//! Runs the periodic membership and quota expiry sweeps on a cron schedule.

mod jobs;

use anyhow::Context;
use quillcheck_billing::QuotaLedger;
use quillcheck_shared::db;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let max_connections: u32 = std::env::var("DATABASE_MAX_CONNECTIONS")
        .unwrap_or_else(|_| "5".to_string())
        .parse()
        .unwrap_or(5);

    let pool = db::create_pool(&database_url, max_connections)
        .await
        .context("failed to connect to database")?;
    let ledger = QuotaLedger::new(pool.clone());

    let scheduler = JobScheduler::new().await?;

    // Membership sweep every 5 minutes
    let sweep_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_id, _sched| {
            let pool = sweep_pool.clone();
            Box::pin(async move {
                jobs::sweep_expired_memberships(&pool).await;
            })
        })?)
        .await?;

    // Quota lapse reconciliation every 15 minutes
    let lapse_pool = pool.clone();
    let lapse_ledger = ledger.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_id, _sched| {
            let pool = lapse_pool.clone();
            let ledger = lapse_ledger.clone();
            Box::pin(async move {
                jobs::lapse_expired_quotas(&pool, &ledger).await;
            })
        })?)
        .await?;

    scheduler.start().await?;
    tracing::info!("quillcheck worker started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");

    Ok(())
}
