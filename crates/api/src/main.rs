//! Quillcheck API server

use anyhow::Context;
use quillcheck_api::{routes::create_router, AppState, Config};
use quillcheck_billing::StatusCache;
use quillcheck_shared::db;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("failed to load configuration")?;

    let pool = db::create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("failed to connect to database")?;
    db::run_migrations(&pool)
        .await
        .context("failed to run migrations")?;

    // The status cache is an optimization; the server runs without it
    let status_cache = match StatusCache::connect(&config.redis_url, config.status_cache_ttl_secs)
        .await
    {
        Ok(cache) => Some(cache),
        Err(e) => {
            tracing::warn!(error = %e, "status cache unavailable, continuing without it");
            None
        }
    };

    let state = AppState::new(&config, pool, status_cache);
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address))?;
    tracing::info!(address = %config.bind_address, "quillcheck api listening");

    axum::serve(listener, router)
        .await
        .context("server error")?;

    Ok(())
}
