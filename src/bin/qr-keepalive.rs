use anyhow::Context;
use dynamic_qr::{config, qr_repo::qr_repository_capsule};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::init_tracing();

    let container = config::init_container().await?;

    container
        .read(qr_repository_capsule)
        .ping()
        .await
        .context("Database keepalive failed")?;
    info!("Database keepalive successful");
    Ok(())
}
