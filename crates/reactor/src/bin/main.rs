use reactor::{Config, NoopReducer, Reactor};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_file("config.toml")?;
    info!("Starting reactor node '{}'", config.server.node_name);

    // Ensure data directory exists
    if let Some(parent) = config.server.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    info!("Opening database at: {:?}", config.server.db_path);
    let reactor = Reactor::new(config, Arc::new(NoopReducer))?;
    reactor.start().await?;

    info!("Reactor running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    info!("Received Ctrl+C, shutting down...");
    reactor.stop(true).await;
    info!("Shutdown complete");
    Ok(())
}
