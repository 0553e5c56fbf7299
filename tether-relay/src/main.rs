use anyhow::Context;
use tether_relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = RelayConfig::from_env()?;
    let server = RelayServer::bind(config).await?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    log::info!("shutting down");
    server.close().await
}
