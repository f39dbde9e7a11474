//! slatefs server binary
//!
//! ```text
//! slatefs --dir ./data --ip 127.0.0.1 --port 8080 --primary ./primary.txt \
//!         --bip 127.0.0.1 --bport 8081
//! ```
//!
//! The server listed in the coordination file (or the first one started)
//! is the primary and takes `--bip/--bport`; the other one is its backup.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::info;

use slatefs::engine::WalConfig;
use slatefs::{Config, Server};

/// slatefs - a replicated, transactional file server
#[derive(Parser, Debug)]
#[command(name = "slatefs")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory
    #[arg(long, default_value = "./data")]
    dir: PathBuf,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    ip: IpAddr,

    /// Port to listen on
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Coordination file naming the current primary
    #[arg(long, default_value = "./primary.txt")]
    primary: PathBuf,

    /// Backup server address (primary only)
    #[arg(long, requires = "bport")]
    bip: Option<IpAddr>,

    /// Backup server port (primary only)
    #[arg(long, requires = "bip")]
    bport: Option<u16>,

    /// Client read timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    read_timeout_ms: u64,

    /// How long a commit waits for the backup, in milliseconds
    #[arg(long, default_value_t = 600)]
    replication_timeout_ms: u64,

    /// Heartbeat interval towards the primary, in milliseconds
    #[arg(long, default_value_t = 2000)]
    probe_interval_ms: u64,

    /// fsync every WAL append on its own instead of batching
    #[arg(long)]
    sync_wal: bool,
}

impl Cli {
    fn into_config(self) -> Config {
        let backup_addr = match (self.bip, self.bport) {
            (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
            _ => None,
        };
        Config {
            bind_addr: SocketAddr::new(self.ip, self.port),
            data_dir: self.dir,
            coordination_file: self.primary,
            backup_addr,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            replication_timeout: Duration::from_millis(self.replication_timeout_ms),
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            wal: if self.sync_wal {
                WalConfig::synchronous()
            } else {
                WalConfig::default()
            },
            ..Config::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().into_config();

    info!("Starting slatefs server...");

    let server = Server::new(config).await?;
    server.run().await?;

    Ok(())
}
