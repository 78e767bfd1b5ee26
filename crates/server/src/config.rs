//! Server configuration
//!
//! All settings come from the environment, read once at startup. Handles
//! built from them are dependency-injected into the engine; nothing in the
//! reconciliation core reads the environment at request time.

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    /// Postgres connection string for the canonical store.
    pub database_url: String,
    /// Redis connection string for the invalidation channel. Optional:
    /// without it, invalidation signals are disabled.
    pub redis_url: Option<String>,
    /// Shared secret for webhook signature verification.
    pub webhook_secret: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let webhook_secret =
            std::env::var("WEBHOOK_SECRET").context("WEBHOOK_SECRET must be set")?;
        let redis_url = std::env::var("REDIS_URL").ok();

        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());

        Ok(Self {
            bind_addr: format!("{}:{}", host, port),
            database_url,
            redis_url,
            webhook_secret,
        })
    }
}
