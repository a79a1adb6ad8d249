// Expense Tracker - Web Server
// Loads configuration, opens the database and the categorization model, then serves the API

use anyhow::{Context, Result};
use expense_tracker::api::{router, AppState};
use expense_tracker::{open_database, Categorizer, Config};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    config.logging.init();

    info!(version = expense_tracker::VERSION, "expense tracker server starting");

    let conn = open_database(&config.db_path)
        .with_context(|| format!("Failed to open database at {:?}", config.db_path))?;

    // A missing artifact only disables /smart-categorize
    let model = Categorizer::load_optional(&config.model_path);

    let app = router(AppState::new(conn, model));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
