use budget_sync::{
    api::{self, handlers::AppState},
    config::CONFIG,
    core::{
        notifier::ChangeNotifier,
        services::{BudgetService, ServiceSettings},
    },
    infrastructure::storage::json_file::JsonFileStorage,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(CONFIG.log_level.as_str())
        .init();
    info!("Starting with {:?}", *CONFIG);

    let storage = JsonFileStorage::open(&CONFIG.data_dir).await?;
    let notifier = ChangeNotifier::new(CONFIG.subscriber_buffer);
    notifier.start();
    let service = Arc::new(BudgetService::new(
        storage,
        notifier.clone(),
        CONFIG.jwt_secret.clone(),
        ServiceSettings::from_config(&CONFIG),
    ));

    let app = api::app(AppState {
        service,
        ping_every: Duration::from_secs(CONFIG.sse_ping_secs.max(1)),
    });

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], CONFIG.port));
    info!("Server running at http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Open event streams would otherwise hold the shutdown open.
            notifier.stop();
        })
        .await?;

    Ok(())
}
