//! PocketSync server binary.
//!
//! Runs the WebSocket sync server over an in-memory document store.

use clap::Parser;
use pocketsync_core::MemoryDocumentStore;
use pocketsync_server::{ServerConfig, SyncServer, TokenValidator};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// PocketSync synchronization server.
#[derive(Parser)]
#[command(name = "pocketsync-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Request path serving the WebSocket upgrade
    #[arg(long, default_value = "/sync")]
    path: String,

    /// Maximum concurrent connections
    #[arg(long, default_value_t = 1000)]
    max_connections: usize,

    /// Delta batch window in milliseconds
    #[arg(long, default_value_t = 50)]
    batch_interval_ms: u64,

    /// HMAC secret for token authentication; enables required auth
    #[arg(long)]
    auth_secret: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = ServerConfig::new(cli.bind)
        .with_ws_path(cli.path)
        .with_max_connections(cli.max_connections)
        .with_batch_interval(Duration::from_millis(cli.batch_interval_ms));
    if cli.auth_secret.is_some() {
        config = config.with_required_auth();
    }

    let store = Arc::new(MemoryDocumentStore::new());
    let server = match cli.auth_secret {
        Some(secret) => SyncServer::with_components(
            config,
            store,
            Arc::new(TokenValidator::new(secret.into_bytes())),
            Arc::new(pocketsync_core::LastWriteWins),
        ),
        None => SyncServer::new(config, store),
    };

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(server.run())?;
    Ok(())
}
