use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use silt_core::registry::EntityRegistry;

mod auth;
mod config;
mod error;
mod rate_limit;
mod routes;
mod service;
mod store;

use auth::AccessTokenVerifier;
use config::AppConfig;
use rate_limit::EndpointRateLimiter;
use routes::{app_router, AppState};
use service::SyncService;
use store::SyncStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Local development convenience; production sets real env vars
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("silt_server=info,tower_http=info")),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!(?config, "Loaded configuration");

    let store = SyncStore::open(&config.database_path).await?;
    let service = Arc::new(SyncService::new(
        store,
        EntityRegistry::standard(),
        config.max_pull_limit,
    ));

    let state = AppState {
        service,
        verifier: AccessTokenVerifier::new(config.clone()),
        rate_limiter: EndpointRateLimiter::from_config(&config),
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "Sync server listening");
    axum::serve(listener, app_router(state)).await?;

    Ok(())
}
