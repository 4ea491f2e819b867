//! imagedesk-server: local web server for the Image Desk app
//!
//! Serves the `imagedesk` asset directory over HTTP on localhost:
//! - Picks the first free port at or above the requested one
//! - Adds permissive CORS headers to every response
//! - Serves script files as `application/javascript`
//! - Configuration via CLI arguments or TOML file

mod config;
mod files;
mod handler;
mod http;
mod mime;
mod port;
mod server;

use config::Config;
use server::Server;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    for notice in &config.notices {
        warn!("{}", notice);
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        host = %config.host,
        port = config.port,
        scan_width = config.scan_width,
        root = %config.root.display(),
        "Starting Image Desk web server"
    );

    let server = Server::bind(&config).await?;

    info!(
        url = %server.url(),
        port = server.local_addr().port(),
        "Image Desk is now available"
    );
    info!(root = %server.root().display(), "Serving files");
    info!("Press Ctrl+C to stop the server");

    server.run().await?;
    Ok(())
}
