mod auth;
mod maintenance;
mod pages;
mod problem;
mod quiz;
mod router;
mod session;
mod tap;
mod telemetry;
mod vote;

use std::net::SocketAddr;

use tracing::info;

use funquiz_storage::Database;
use funquiz_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!(stage = "storage", url = %config.database_url, "database ready");

    let tap_hub = tap::TapHub::new();

    maintenance::SessionSweeper::new(database.clone(), tap_hub.clone()).spawn();

    let state = router::AppState::new(
        metrics,
        tap_hub,
        database,
        pages::Pages::new()?,
        router::HttpSettings::from_config(&config),
    );

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
