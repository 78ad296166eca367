//! lanshared: LAN collaborative note-store daemon.
//!
//! Owns the authoritative document, accepts WebSocket clients, applies
//! their intents, and broadcasts full snapshots to everyone on any change.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lanshare_daemon::daemon::Daemon;
use lanshare_daemon::server::WsServer;
use lanshare_daemon::storage::DocumentStorage;

#[derive(Parser, Debug)]
#[command(name = "lanshared")]
#[command(about = "LAN collaborative note-store daemon")]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8081)]
    port: u16,

    /// Path to the database file
    #[arg(long, default_value = "db.json")]
    data: PathBuf,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,lanshare_daemon=debug"
    } else {
        "info,lanshare_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting lanshared");
    info!("Database path: {:?}", args.data);

    let storage = DocumentStorage::new(args.data);
    // The handle is the integration point for the file sharing endpoints;
    // the bare daemon has no other producer for it.
    let (daemon, _handle) = Daemon::new(storage)?;

    let listener = WsServer::bind(&format!("{}:{}", args.host, args.port)).await?;

    info!("Daemon running. Press Ctrl+C to stop.");
    daemon.run(listener).await
}
