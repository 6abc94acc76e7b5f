mod auth;
mod config;
mod error;
mod rate_limit;
mod routes;

use std::sync::Arc;

use innsync_core::services::SyncStore;
use innsync_core::SyncContext;

use config::AppConfig;
use rate_limit::TriggerRateLimiter;
use routes::{app_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("innsync_api=info".parse().expect("valid directive"))
                .add_directive("innsync_core=info".parse().expect("valid directive")),
        )
        .init();

    let config = AppConfig::from_env()?;
    tracing::info!("Starting innsync-api with config: {:?}", config);

    let store = SyncStore::open_path(config.database_path.clone()).await?;
    tracing::info!(
        path = %config.database_path.display(),
        schema_version = store.schema_version().await?,
        "Sync store ready"
    );
    let env = config.connection.connect(store, config.sync.clone())?;
    let mut context = SyncContext::start(env, config.webhook_secret.as_bytes());
    context.spawn_scheduler();

    let state = AppState::new(
        Arc::new(context),
        TriggerRateLimiter::from_config(&config),
        config.operator_token.as_deref(),
    );
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("innsync-api listening on {}", config.bind_addr);
    axum::serve(listener, router).await?;
    Ok(())
}
