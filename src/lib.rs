//! slatefs - a replicated, transactional file server
//!
//! Clients open a transaction on one file, stream numbered writes, and
//! commit. Committed writes are appended to the file atomically and
//! replicated to a hot standby.
//!
//! Architecture Overview:
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Clients / Peer                          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Protocol Handler                          │
//! │     (text requests, peer frames routed by first byte)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                    ┌─────────┴─────────┐
//!                    ▼                   ▼
//! ┌──────────────────────────┐ ┌────────────────────────────────┐
//! │   Commit Coordinator     │ │        Replication             │
//! │ (txns, LSNs, WAL, queue) │ │ (backup link, sync, failover)  │
//! └──────────────────────────┘ └────────────────────────────────┘
//!                    │
//!                    ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     File Store                              │
//! │          (data files, staging files, .slatelog)             │
//! └─────────────────────────────────────────────────────────────┘

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::net::TcpListener;

pub mod engine;
pub mod error;
pub mod protocol;
pub mod replication;
pub mod storage;

use crate::engine::{CommitCoordinator, WalConfig};
use crate::error::{Result, SlateError};
use crate::protocol::handle_connection;
use crate::replication::{
    sync_from_primary, BackupLink, ClusterState, CoordinationFile, CoordinationRecord,
    FailoverMonitor, Role,
};

/// Run a blocking engine call on tokio's blocking pool
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SlateError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the server to
    pub bind_addr: SocketAddr,
    /// Directory for data files and the write-ahead log
    pub data_dir: PathBuf,
    /// File naming the current primary, shared by both servers
    pub coordination_file: PathBuf,
    /// Backup server, only meaningful for the primary
    pub backup_addr: Option<SocketAddr>,
    /// Idle and per-request read timeout on client connections
    pub read_timeout: Duration,
    /// How long a commit waits for the backup before answering anyway
    pub replication_timeout: Duration,
    /// Bound on the startup sync with the primary
    pub sync_timeout: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub wal: WalConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            data_dir: PathBuf::from("./data"),
            coordination_file: PathBuf::from("./primary.txt"),
            backup_addr: None,
            read_timeout: Duration::from_secs(5),
            replication_timeout: Duration::from_millis(600),
            sync_timeout: Duration::from_secs(10),
            probe_interval: Duration::from_secs(2),
            probe_timeout: Duration::from_millis(250),
            wal: WalConfig::default(),
        }
    }
}

/// Everything a connection task needs
pub struct ServerContext {
    pub coordinator: Arc<CommitCoordinator>,
    pub cluster: Arc<ClusterState>,
    /// Present only on a primary started with a backup address
    pub backup: Option<BackupLink>,
    pub config: Config,
}

/// The file server
pub struct Server {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
}

impl Server {
    /// Bind, recover, and settle this server's role.
    ///
    /// A backup synchronizes with the primary before returning and promotes
    /// itself if the primary cannot be reached.
    pub async fn new(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let listener = TcpListener::bind(config.bind_addr).await?;
        let local = listener.local_addr()?;

        let data_dir = config.data_dir.clone();
        let wal_config = config.wal.clone();
        let coordinator =
            Arc::new(blocking(move || CommitCoordinator::open(data_dir, wal_config)).await?);

        let coordination = CoordinationFile::new(config.coordination_file.clone());
        let (role, primary) = match coordination.read()? {
            None => {
                coordination.write(&CoordinationRecord::new(local, 0))?;
                (Role::Primary, local)
            }
            Some(record) if record.primary == local => (Role::Primary, local),
            Some(record) => (Role::Backup, record.primary),
        };

        if role == Role::Backup && config.backup_addr.is_some() {
            return Err(SlateError::Config(format!(
                "{} is a backup of {}, it cannot have a backup of its own",
                local, primary
            )));
        }
        if role == Role::Primary && config.backup_addr.is_none() {
            warn!("No backup configured, running unreplicated");
        }

        let cluster = Arc::new(ClusterState::new(role, local, primary, coordination));
        let backup = config.backup_addr.map(|addr| {
            BackupLink::new(
                Arc::clone(&coordinator),
                Arc::clone(&cluster),
                addr,
                config.replication_timeout,
            )
        });

        info!("slatefs {} listening on {}", role, local);
        info!("Data directory: {:?}", config.data_dir);

        if role == Role::Backup {
            match sync_from_primary(Arc::clone(&coordinator), primary, config.sync_timeout).await {
                Ok(_) => {
                    FailoverMonitor::new(
                        Arc::clone(&cluster),
                        config.probe_interval,
                        config.probe_timeout,
                    )
                    .spawn();
                }
                Err(e) => {
                    warn!("Could not sync with primary {}: {}", primary, e);
                    cluster.promote()?;
                }
            }
        }

        Ok(Self {
            listener,
            ctx: Arc::new(ServerContext {
                coordinator,
                cluster,
                backup,
                config,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.ctx.cluster.local_addr()
    }

    pub fn coordinator(&self) -> Arc<CommitCoordinator> {
        Arc::clone(&self.ctx.coordinator)
    }

    pub fn cluster(&self) -> Arc<ClusterState> {
        Arc::clone(&self.ctx.cluster)
    }

    /// Run the server, accepting connections
    pub async fn run(self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    log::debug!("New connection from {}", addr);
                    if let Err(e) = stream.set_nodelay(true) {
                        error!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                    }

                    let ctx = Arc::clone(&self.ctx);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, ctx).await {
                            error!("Connection error from {}: {}", addr, e);
                        }
                        log::debug!("Connection closed: {}", addr);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}
