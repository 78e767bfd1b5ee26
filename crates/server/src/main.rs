//! Clientdeck Billing Server
//!
//! Hosts the billing event reconciliation engine behind the inbound webhook
//! endpoint, plus health and diagnostics routes.

mod config;
mod error;
mod routes;
mod state;

use std::sync::Arc;
use std::time::Duration;

use clientdeck_reconciler::{BillingEmailService, InvalidationSignaler, ReconciliationService};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::routes::create_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "info,clientdeck_server=debug,clientdeck_reconciler=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting Clientdeck billing server v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await?;
    tracing::info!("Database connection established");

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("Migrations applied");

    // The invalidation channel is best-effort: a missing or unreachable Redis
    // disables it without affecting reconciliation.
    let signaler = match &config.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str())?;
            match client.get_connection_manager().await {
                Ok(conn) => {
                    tracing::info!("Redis connection established");
                    InvalidationSignaler::new_redis(conn)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Redis unavailable - invalidation signals disabled");
                    InvalidationSignaler::disabled()
                }
            }
        }
        None => {
            tracing::info!("REDIS_URL not set - invalidation signals disabled");
            InvalidationSignaler::disabled()
        }
    };

    let email = BillingEmailService::from_env();

    let service =
        ReconciliationService::new(pool, &config.webhook_secret, signaler, email);
    let state = AppState {
        reconciliation: Arc::new(service),
    };

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        return;
    }
    tracing::info!("Shutdown signal received, stopping server...");
}
