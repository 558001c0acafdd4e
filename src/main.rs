//! CertProxy - Main entry point
//!
//! Reverse proxy with static files and automatic ACME certificates

use anyhow::{Context, Result};
use certproxy::{ProxyConfig, ProxyServer, Settings};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::parse();

    // Initialize logging
    let log_level = match settings.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting CertProxy v{}", env!("CARGO_PKG_VERSION"));

    let config = ProxyConfig::from_settings(settings).context("invalid configuration")?;

    info!("Upstream: {}://{}", config.upstream.scheme, config.upstream.host);
    info!(
        "Static files: /{}/ -> {}",
        config.static_prefix,
        config.static_dir.display()
    );
    if config.tls_enabled() {
        let domains: Vec<&str> = config.domains.iter().collect();
        info!("Certificate whitelist: {}", domains.join(", "));
    }

    let server = Arc::new(ProxyServer::new(config)?);
    server.run().await
}
