use anyhow::Context;
use dynamic_qr::{api, config, qr_service::qr_record_service_capsule};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::init_tracing();

    let container = config::init_container().await?;

    let app = api::router(
        container.read(qr_record_service_capsule),
        container.read(config::request_timeout_capsule),
    );

    let listener = TcpListener::bind(container.read(config::addr_capsule)).await?;
    info!(addr = %listener.local_addr()?, "Started listening on TCP");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Closing database connection");
    container
        .read(config::db_conn_capsule)
        .close()
        .await
        .context("Failed to close database connection")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(?err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received; draining connections");
}
