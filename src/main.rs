//! Minimal binary running a `playwire` server from a TOML configuration.

mod cli;

use clap::Parser;
use playwire::{Server, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt::init();

    let cli = cli::Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_toml_str(&std::fs::read_to_string(path)?)?,
        None => ServerConfig::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }

    let server = Server::bind(config).await?;
    server.run().await?;
    Ok(())
}
