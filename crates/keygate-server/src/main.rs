//! keygate-server binary entry point

use anyhow::Result;
use keygate_server::{LicenseServer, ServerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = ServerConfig::load()?;

    // Create and run server
    let server = LicenseServer::new(config).await?;
    server.run().await?;

    Ok(())
}
