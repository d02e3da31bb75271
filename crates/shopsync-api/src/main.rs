mod config;
mod error;
mod routes;
mod sweeper;

use std::sync::Arc;

use config::AppConfig;
use routes::{app_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("shopsync_api=info".parse()?)
                .add_directive("shopsync_core=info".parse()?),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting shopsync-api with config: {:?}", config);

    let state = AppState::from_config(config).await?;
    let bind_addr = state.config.bind_addr.clone();

    match state.config.sweep_interval {
        Some(interval) => {
            sweeper::spawn(state.clone(), interval);
        }
        None => tracing::info!("Periodic reconciliation sweep disabled"),
    }

    let router = app_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("shopsync-api listening on {}", bind_addr);
    axum::serve(listener, router).await?;
    Ok(())
}
