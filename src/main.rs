//! Decoy - SSH honeypot with per-attacker overlay sandboxes.
//!
//! Usage:
//!   decoy serve [--port 2222] [--stats-port 8080] [--host-key PATH]

use clap::Parser;
use decoy::config::{Args, Commands};
use std::process::exit;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    // Overlay mounts need CAP_SYS_ADMIN
    if !nix::unistd::geteuid().is_root() {
        warn!("Not running as root, sandbox mounts will fail");
    }

    match args.command {
        Commands::Serve(serve) => {
            let config = match serve.into_config() {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(2);
                }
            };
            if let Err(e) = decoy::server::run(config).await {
                error!(error = %e, "Server stopped");
                exit(1);
            }
        }
    }
}
