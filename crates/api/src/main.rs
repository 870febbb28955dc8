use std::sync::Arc;

use anyhow::Context;

use taskboard_api::app::{build_app, services::AppServices};
use taskboard_infra::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    taskboard_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let bind_addr = config.bind_addr;

    let services = Arc::new(AppServices::builder(config).build().await?);
    let worker = services.queue.start();

    let app = build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("draining job queue");
    services.queue.close();
    worker.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
