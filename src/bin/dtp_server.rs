use std::{error::Error, net::SocketAddr, path::PathBuf, sync::mpsc, time::Duration};

use clap::Parser;
use dtp::{Server, ServerConfig, blob::BlobStore};
use log::info;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to blob storage directory
    path: PathBuf,
    /// Listen for new connection at address
    address: SocketAddr,
    /// Maximum number of concurrent connections
    #[arg(long, default_value_t = 15)]
    max_connections: usize,
    /// Maximum side channel listeners per bind address
    #[arg(long, default_value_t = 8)]
    max_listeners: usize,
    /// Maximum concurrent side channel transfers
    #[arg(long, default_value_t = 16)]
    max_transfers: usize,
    /// Close connections idle for this many seconds
    #[arg(long)]
    idle_timeout: Option<u64>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = ServerConfig {
        max_handler_threads: cli.max_connections,
        max_listeners_per_bind_addr: cli.max_listeners,
        max_raw_data_threads: cli.max_transfers,
        idle_timeout: cli.idle_timeout.map(Duration::from_secs),
        ..ServerConfig::new(cli.address)
    };

    BlobStore::open(cli.path.clone())?;
    let dir = cli.path;
    let server = Server::new(config, move || BlobStore::new(dir.clone()))?;
    server.start()?;

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;
    stop_rx.recv()?;

    info!("shutting down");
    server.close();
    Ok(())
}
