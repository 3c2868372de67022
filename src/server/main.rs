//! PeerCall Relay - Main Entry Point
//!
//! Signaling relay: assigns peer ids and forwards call setup messages.

use anyhow::Result;
use clap::Parser;
use log::info;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

use peercall::relay::{load_tls_acceptor, serve};
use peercall::{IdentityRegistry, Router, ServerConfig};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "peercall-relay")]
#[command(about = "PeerCall signaling relay")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/relay.toml")]
    config: PathBuf,

    /// Override host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Override listening port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = if args.config.exists() {
        ServerConfig::from_file(&args.config)?
    } else {
        ServerConfig::default()
    };

    // Initialize logging
    let log_level = args.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&log_level)).init();

    if !args.config.exists() {
        info!("Config file {} not found, using defaults", args.config.display());
    }

    let host = args.host.unwrap_or(config.host.clone());
    let port = args.port.unwrap_or(config.port);

    let acceptor = match config.tls_files() {
        Some((certfile, keyfile)) => {
            info!("TLS enabled with {}", certfile.display());
            Some(load_tls_acceptor(certfile, keyfile)?)
        }
        None => None,
    };

    let router = Arc::new(Router::new(IdentityRegistry::new(config.id_length)));

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("Relay is running on {}", addr);

    tokio::select! {
        _ = serve(listener, router, acceptor) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }
    Ok(())
}
