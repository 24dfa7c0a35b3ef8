use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use labelq_server::config::Config;
use labelq_server::http::router;
use labelq_server::lease::{LeaseStore, SqliteLeaseBackend};
use labelq_server::reconciliation::Sweeper;
use labelq_server::repository::{ItemRepository, SqliteItemRepository};
use labelq_server::shutdown::install_shutdown_handler;
use labelq_server::{AppState, TaskCoordinator};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting labelq task server");

    let config = Config::from_env().context("Failed to load configuration from environment")?;

    let items_path = config.items_db_path();
    info!("Using item database: {}", items_path.display());
    let items: Arc<dyn ItemRepository> = Arc::new(
        SqliteItemRepository::new(&items_path).context("Failed to open item database")?,
    );

    let leases_path = config.leases_db_path();
    info!("Using lease database: {}", leases_path.display());
    let leases = LeaseStore::new(Arc::new(
        SqliteLeaseBackend::new(&leases_path).context("Failed to open lease database")?,
    ));

    let shutdown = install_shutdown_handler().context("Failed to install signal handlers")?;

    let sweeper = Sweeper::new(items.clone(), leases.clone(), config.sweep_interval);
    let sweeper_task = tokio::spawn(sweeper.run(shutdown.clone()));

    let app_state = Arc::new(AppState {
        coordinator: Arc::new(TaskCoordinator::new(
            items,
            leases,
            config.coordinator_settings(),
        )),
    });
    let app = router(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    info!("Server listening on port {}", config.port);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    shutdown.cancel();
    sweeper_task.await.context("Sweeper task panicked")?;
    info!("Shutdown complete");

    Ok(())
}
