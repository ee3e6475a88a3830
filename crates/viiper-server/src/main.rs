use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use viiper_server::{Server, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env().context("invalid VIIPER_* environment")?;
    let server = Server::start(config).await.context("failed to start")?;
    info!(
        usbip = %server.usbip_addr(),
        control = %server.control_addr(),
        "ready; press ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutting down");
    server.shutdown().await;
    Ok(())
}
