use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use policyca_server::config::{Cli, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // rustls needs an explicit provider selection.
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();
    // Use JSON logs in production (POLICYCA_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("POLICYCA_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("policyca_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let cli = Cli::parse();
    let config = ServerConfig::from_cli(&cli)?;
    tracing::info!("Starting certificate authority on {}", config.listen_addr);
    if config.learn {
        tracing::info!("Learn mode enabled");
    }

    let server = policyca_server::server::Server::new(config);
    server.run().await
}
