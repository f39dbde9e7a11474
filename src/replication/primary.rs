//! Primary side of replication
//!
//! After a local commit the connection handler calls
//! [`BackupLink::replicate`]. One replication exchange runs at a time:
//!
//! 1. Bind a fresh local port and publish it in the coordination file
//! 2. Connect to the backup and send the committed transaction
//! 3. Answer `AskResend(n)` with the transaction for LSN `n`
//! 4. On `Ack(n)` below the target, send LSN `n + 1`; on the target, done
//!
//! The whole exchange is bounded by the replication timeout. Failures are
//! logged and the client is acknowledged anyway.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Mutex;

use crate::engine::{CommitCoordinator, Lsn, TxnId};
use crate::error::{Result, SlateError};
use super::failover::ClusterState;
use super::message::{read_message, write_message, PeerMessage};

/// Outgoing replication channel to the backup
pub struct BackupLink {
    coordinator: Arc<CommitCoordinator>,
    cluster: Arc<ClusterState>,
    backup: SocketAddr,
    timeout: Duration,
    in_flight: Mutex<()>,
}

impl BackupLink {
    pub fn new(
        coordinator: Arc<CommitCoordinator>,
        cluster: Arc<ClusterState>,
        backup: SocketAddr,
        timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            cluster,
            backup,
            timeout,
            in_flight: Mutex::new(()),
        }
    }

    pub fn backup_addr(&self) -> SocketAddr {
        self.backup
    }

    /// Replicate a committed transaction. Returns true when the backup
    /// acknowledged it within the timeout.
    pub async fn replicate(&self, txn_id: TxnId) -> bool {
        let _single_flight = self.in_flight.lock().await;
        match tokio::time::timeout(self.timeout, self.exchange(txn_id)).await {
            Ok(Ok(lsn)) => {
                log::debug!("Backup acknowledged transaction {} (LSN {})", txn_id, lsn);
                true
            }
            Ok(Err(e)) => {
                log::warn!("Replication of transaction {} failed: {}", txn_id, e);
                false
            }
            Err(_) => {
                log::warn!(
                    "Replication of transaction {} timed out after {:?}",
                    txn_id,
                    self.timeout
                );
                false
            }
        }
    }

    async fn exchange(&self, txn_id: TxnId) -> Result<Lsn> {
        let record = self.coordinator.snapshot(txn_id)?;
        let target = record.commit_lsn().ok_or_else(|| {
            SlateError::Replication(format!("transaction {} has no commit LSN", txn_id))
        })?;

        let mut stream = self.connect().await?;
        write_message(&mut stream, &PeerMessage::Commit(record)).await?;
        drive_to_ack(&mut stream, &self.coordinator, txn_id, target).await?;
        Ok(target)
    }

    /// Connect from a fresh local port that the backup can verify
    async fn connect(&self) -> Result<TcpStream> {
        let socket = if self.backup.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.bind(SocketAddr::new(self.cluster.local_addr().ip(), 0))?;
        let commit_port = socket.local_addr()?.port();
        self.cluster.set_commit_port(commit_port)?;

        let stream = socket.connect(self.backup).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Serve the backup's resend requests until it acknowledges `target`
async fn drive_to_ack<S>(
    stream: &mut S,
    coordinator: &CommitCoordinator,
    txn_id: TxnId,
    target: Lsn,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let next = match read_message(stream).await? {
            None => {
                return Err(SlateError::Replication(
                    "backup closed the connection".to_string(),
                ))
            }
            Some(PeerMessage::Ack { commit_lsn }) if commit_lsn >= target => {
                coordinator.mark_backup_ack(txn_id)?;
                return Ok(());
            }
            Some(PeerMessage::Ack { commit_lsn }) => {
                if let Some(acked) = coordinator.record_by_lsn(commit_lsn) {
                    coordinator.mark_backup_ack(acked.id())?;
                }
                commit_lsn + 1
            }
            Some(PeerMessage::AskResend { commit_lsn }) => {
                log::debug!("Backup asked to resend LSN {}", commit_lsn);
                commit_lsn
            }
            Some(other) => {
                return Err(SlateError::Replication(format!(
                    "unexpected {} from backup",
                    other.name()
                )))
            }
        };

        let record = coordinator.record_by_lsn(next).ok_or_else(|| {
            SlateError::Replication(format!("no committed transaction with LSN {}", next))
        })?;
        write_message(stream, &PeerMessage::Commit(record)).await?;
    }
}

/// Answer a backup's startup `SyncRequest` with every later commit
pub async fn serve_sync<S>(
    stream: &mut S,
    peer: SocketAddr,
    coordinator: &CommitCoordinator,
    allowed: Option<SocketAddr>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(backup) = allowed {
        if backup.ip() != peer.ip() {
            return Err(SlateError::Replication(format!(
                "sync request from {} rejected, backup is {}",
                peer,
                backup.ip()
            )));
        }
    }

    match read_message(stream).await? {
        None => Ok(()),
        Some(PeerMessage::SyncRequest { after_lsn }) => {
            let records = coordinator.records_after(after_lsn);
            log::info!(
                "Backup {} synchronizing {} commits after LSN {}",
                peer,
                records.len(),
                after_lsn
            );
            write_message(stream, &PeerMessage::SyncResponse { records }).await
        }
        Some(other) => Err(SlateError::Replication(format!(
            "unexpected {} from {}",
            other.name(),
            peer
        ))),
    }
}
