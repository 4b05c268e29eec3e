//! Application configuration

use std::env;

use quillcheck_billing::{GatewayConfig, DEFAULT_PENDING_TTL_MINUTES};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub public_url: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Redis
    pub redis_url: String,
    pub status_cache_ttl_secs: u64,

    // Payment gateway
    pub gateway_base_url: String,
    pub gateway_app_id: String,
    pub gateway_secret: String,
    pub gateway_notify_url: String,

    // Orders
    pub order_ttl_minutes: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let public_url =
            env::var("PUBLIC_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            public_url: public_url.clone(),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),

            // Redis
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            status_cache_ttl_secs: env::var("STATUS_CACHE_TTL_SECS")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .unwrap_or(3600),

            // Payment gateway
            gateway_base_url: env::var("GATEWAY_BASE_URL")
                .map_err(|_| ConfigError::Missing("GATEWAY_BASE_URL"))?,
            gateway_app_id: env::var("GATEWAY_APP_ID")
                .map_err(|_| ConfigError::Missing("GATEWAY_APP_ID"))?,
            gateway_secret: {
                let secret = env::var("GATEWAY_SECRET")
                    .map_err(|_| ConfigError::Missing("GATEWAY_SECRET"))?;
                // The callback signature is only as strong as this secret
                if secret.len() < 16 {
                    return Err(ConfigError::WeakSecret(
                        "GATEWAY_SECRET must be at least 16 characters",
                    ));
                }
                secret
            },
            gateway_notify_url: env::var("GATEWAY_NOTIFY_URL")
                .unwrap_or_else(|_| format!("{}/api/payment/callback", public_url)),

            // Orders
            order_ttl_minutes: env::var("ORDER_TTL_MINUTES")
                .unwrap_or_else(|_| DEFAULT_PENDING_TTL_MINUTES.to_string())
                .parse()
                .unwrap_or(DEFAULT_PENDING_TTL_MINUTES),
        })
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            base_url: self.gateway_base_url.clone(),
            app_id: self.gateway_app_id.clone(),
            secret: self.gateway_secret.clone(),
            notify_url: self.gateway_notify_url.clone(),
        }
    }
}
