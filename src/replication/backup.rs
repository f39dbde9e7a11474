//! Backup side of replication
//!
//! - `serve_primary` handles a replication connection from the primary:
//!   every `Commit` frame is applied in LSN order and answered with `Ack`
//!   or `AskResend`
//! - `sync_from_primary` runs once at startup and pulls every commit the
//!   backup missed while it was down

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::blocking;
use crate::engine::{ApplyOutcome, CommitCoordinator, TransactionRecord};
use crate::error::{Result, SlateError};
use super::message::{read_message, write_message, PeerMessage};

/// Apply commits sent by the primary until it closes the connection
pub async fn serve_primary<S>(stream: &mut S, coordinator: Arc<CommitCoordinator>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = read_message(stream).await? {
        let record = match message {
            PeerMessage::Commit(record) => record,
            other => {
                return Err(SlateError::Replication(format!(
                    "unexpected {} from primary",
                    other.name()
                )))
            }
        };

        let reply = match apply(&coordinator, record).await? {
            ApplyOutcome::Applied(commit_lsn) | ApplyOutcome::Duplicate(commit_lsn) => {
                PeerMessage::Ack { commit_lsn }
            }
            ApplyOutcome::Expected(commit_lsn) => {
                log::debug!("Out of order commit, asking primary for LSN {}", commit_lsn);
                PeerMessage::AskResend { commit_lsn }
            }
        };
        write_message(stream, &reply).await?;
    }
    Ok(())
}

/// Pull every commit after our current LSN from the primary.
/// Returns the number of transactions applied.
pub async fn sync_from_primary(
    coordinator: Arc<CommitCoordinator>,
    primary: SocketAddr,
    timeout: Duration,
) -> Result<usize> {
    let after_lsn = coordinator.current_lsn();
    let records = tokio::time::timeout(timeout, request_sync(primary, after_lsn))
        .await
        .map_err(|_| SlateError::Timeout(format!("sync with {} timed out", primary)))??;

    let mut applied = 0;
    for record in records {
        match apply(&coordinator, record).await? {
            ApplyOutcome::Applied(_) => applied += 1,
            ApplyOutcome::Duplicate(_) => {}
            ApplyOutcome::Expected(lsn) => {
                return Err(SlateError::Replication(format!(
                    "sync response skipped LSN {}",
                    lsn
                )))
            }
        }
    }
    log::info!(
        "Synchronized {} commits from primary {}, now at LSN {}",
        applied,
        primary,
        coordinator.current_lsn()
    );
    Ok(applied)
}

async fn request_sync(primary: SocketAddr, after_lsn: u64) -> Result<Vec<TransactionRecord>> {
    let mut stream = TcpStream::connect(primary).await?;
    stream.set_nodelay(true)?;
    write_message(&mut stream, &PeerMessage::SyncRequest { after_lsn }).await?;
    match read_message(&mut stream).await? {
        Some(PeerMessage::SyncResponse { records }) => Ok(records),
        Some(other) => Err(SlateError::Replication(format!(
            "unexpected {} in reply to sync request",
            other.name()
        ))),
        None => Err(SlateError::Replication(
            "primary closed the connection during sync".to_string(),
        )),
    }
}

async fn apply(coordinator: &Arc<CommitCoordinator>, record: TransactionRecord) -> Result<ApplyOutcome> {
    let coordinator = Arc::clone(coordinator);
    blocking(move || coordinator.apply_replicated(record)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CommitOutcome, Lsn, WalConfig};

    fn committed(coord: &CommitCoordinator, filename: &str, data: &str) -> Lsn {
        let txn_id = coord.new_transaction(filename).unwrap();
        coord.write(txn_id, 1, data.as_bytes().to_vec()).unwrap();
        match coord.request_commit(txn_id, 1).unwrap() {
            CommitOutcome::Committed { commit_lsn, .. } => commit_lsn,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_backup_asks_for_missing_lsn() {
        let primary_dir = tempfile::tempdir().unwrap();
        let backup_dir = tempfile::tempdir().unwrap();
        let primary = CommitCoordinator::open(primary_dir.path(), WalConfig::default()).unwrap();
        let backup = Arc::new(
            CommitCoordinator::open(backup_dir.path(), WalConfig::default()).unwrap(),
        );
        for data in ["a", "b", "c", "d", "e"] {
            committed(&primary, "f.txt", data);
        }
        // backup already holds LSNs 1..=3
        for lsn in 1..=3 {
            backup
                .apply_replicated(primary.record_by_lsn(lsn).unwrap())
                .unwrap();
        }

        let (mut primary_end, mut backup_end) = tokio::io::duplex(64 * 1024);
        let session = {
            let backup = Arc::clone(&backup);
            tokio::spawn(async move { serve_primary(&mut backup_end, backup).await })
        };

        let send = |lsn| PeerMessage::Commit(primary.record_by_lsn(lsn).unwrap());
        write_message(&mut primary_end, &send(5)).await.unwrap();
        assert_eq!(
            read_message(&mut primary_end).await.unwrap(),
            Some(PeerMessage::AskResend { commit_lsn: 4 })
        );
        assert_eq!(backup.current_lsn(), 3);

        write_message(&mut primary_end, &send(4)).await.unwrap();
        assert_eq!(
            read_message(&mut primary_end).await.unwrap(),
            Some(PeerMessage::Ack { commit_lsn: 4 })
        );
        write_message(&mut primary_end, &send(5)).await.unwrap();
        assert_eq!(
            read_message(&mut primary_end).await.unwrap(),
            Some(PeerMessage::Ack { commit_lsn: 5 })
        );
        // a stale resend is acknowledged without reapplying
        write_message(&mut primary_end, &send(2)).await.unwrap();
        assert_eq!(
            read_message(&mut primary_end).await.unwrap(),
            Some(PeerMessage::Ack { commit_lsn: 2 })
        );

        drop(primary_end);
        session.await.unwrap().unwrap();
        assert_eq!(backup.read_file("f.txt").unwrap(), b"abcde".to_vec());
    }

    #[tokio::test]
    async fn test_serve_primary_rejects_other_messages() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backup = Arc::new(CommitCoordinator::open(temp_dir.path(), WalConfig::default()).unwrap());
        let (mut primary_end, mut backup_end) = tokio::io::duplex(4096);
        write_message(&mut primary_end, &PeerMessage::SyncRequest { after_lsn: 0 })
            .await
            .unwrap();
        assert!(serve_primary(&mut backup_end, backup).await.is_err());
    }

    #[tokio::test]
    async fn test_sync_fails_when_primary_unreachable() {
        let temp_dir = tempfile::tempdir().unwrap();
        let backup = Arc::new(CommitCoordinator::open(temp_dir.path(), WalConfig::default()).unwrap());
        let dead = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let result = sync_from_primary(backup, dead, Duration::from_millis(500)).await;
        assert!(result.is_err());
    }
}
