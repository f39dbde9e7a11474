//! Roles, the coordination file, and backup promotion
//!
//! The coordination file is a single line shared by both servers:
//!
//! ```text
//! <primary-ip> <primary-port> <commit-port>
//! ```
//!
//! The primary rewrites the commit port before each replication connection
//! so the backup can check where peer traffic comes from. A backup that
//! promotes itself rewrites the whole line with its own address and a zero
//! commit port.
//!
//! Promotion happens after a single failed probe. There is no quorum, so a
//! network partition can leave two primaries.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::error::{Result, SlateError};

/// Role of this server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Backup,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Backup => write!(f, "backup"),
        }
    }
}

/// Content of the coordination file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinationRecord {
    pub primary: SocketAddr,
    /// Local port of the primary's current replication connection (0 = none)
    pub commit_port: u16,
}

impl CoordinationRecord {
    pub fn new(primary: SocketAddr, commit_port: u16) -> Self {
        Self {
            primary,
            commit_port,
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() != 3 {
            return Err(SlateError::Config(format!(
                "coordination file needs 3 fields, found {}",
                fields.len()
            )));
        }
        let ip: IpAddr = fields[0]
            .parse()
            .map_err(|e| SlateError::Config(format!("bad primary address {}: {}", fields[0], e)))?;
        let port: u16 = fields[1]
            .parse()
            .map_err(|e| SlateError::Config(format!("bad primary port {}: {}", fields[1], e)))?;
        let commit_port: u16 = fields[2]
            .parse()
            .map_err(|e| SlateError::Config(format!("bad commit port {}: {}", fields[2], e)))?;
        Ok(Self::new(SocketAddr::new(ip, port), commit_port))
    }

    /// True when `peer` is the primary's replication connection
    pub fn is_replication_source(&self, peer: SocketAddr) -> bool {
        self.commit_port != 0 && peer.ip() == self.primary.ip() && peer.port() == self.commit_port
    }
}

impl fmt::Display for CoordinationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.primary.ip(),
            self.primary.port(),
            self.commit_port
        )
    }
}

/// The coordination file on disk
#[derive(Debug, Clone)]
pub struct CoordinationFile {
    path: PathBuf,
}

impl CoordinationFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current record, `None` if the file does not exist yet
    pub fn read(&self) -> Result<Option<CoordinationRecord>> {
        match fs::read_to_string(&self.path) {
            Ok(text) => CoordinationRecord::parse(&text).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the file atomically
    pub fn write(&self, record: &CoordinationRecord) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        writeln!(tmp, "{}", record)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| SlateError::Io(e.error))?;
        Ok(())
    }
}

/// Shared view of who is primary
#[derive(Debug)]
pub struct ClusterState {
    role: RwLock<Role>,
    local: SocketAddr,
    primary: RwLock<SocketAddr>,
    coordination: CoordinationFile,
}

impl ClusterState {
    pub fn new(role: Role, local: SocketAddr, primary: SocketAddr, coordination: CoordinationFile) -> Self {
        Self {
            role: RwLock::new(role),
            local,
            primary: RwLock::new(primary),
            coordination,
        }
    }

    pub fn role(&self) -> Role {
        *self.role.read().expect("role lock poisoned")
    }

    pub fn is_primary(&self) -> bool {
        self.role() == Role::Primary
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Address clients should talk to
    pub fn primary_addr(&self) -> SocketAddr {
        *self.primary.read().expect("primary lock poisoned")
    }

    pub fn coordination(&self) -> &CoordinationFile {
        &self.coordination
    }

    /// Publish the local port of the primary's next replication connection
    pub fn set_commit_port(&self, commit_port: u16) -> Result<()> {
        self.coordination
            .write(&CoordinationRecord::new(self.local, commit_port))
    }

    /// Become primary. Returns false if already primary.
    pub fn promote(&self) -> Result<bool> {
        {
            let mut role = self.role.write().expect("role lock poisoned");
            if *role == Role::Primary {
                return Ok(false);
            }
            *role = Role::Primary;
        }
        *self.primary.write().expect("primary lock poisoned") = self.local;
        self.coordination
            .write(&CoordinationRecord::new(self.local, 0))?;
        log::info!("Promoted to primary at {}", self.local);
        Ok(true)
    }
}

/// Probe `addr` with a TCP connect
pub async fn probe(addr: SocketAddr, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Backup-side heartbeat: promotes this server when the primary stops answering
pub struct FailoverMonitor {
    cluster: Arc<ClusterState>,
    interval: Duration,
    timeout: Duration,
}

impl FailoverMonitor {
    pub fn new(cluster: Arc<ClusterState>, interval: Duration, timeout: Duration) -> Self {
        Self {
            cluster,
            interval,
            timeout,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Probe until the primary fails once, then promote
    pub async fn run(self) {
        loop {
            tokio::time::sleep(self.interval).await;
            if self.cluster.is_primary() {
                return;
            }
            let primary = self.cluster.primary_addr();
            if probe(primary, self.timeout).await {
                log::debug!("Primary {} is alive", primary);
                continue;
            }

            log::warn!("Primary {} did not answer, promoting this server", primary);
            if let Err(e) = self.cluster.promote() {
                log::error!("Promotion failed: {}", e);
            }
            return;
        }
    }
}
