//! Inter-server messages and framing
//!
//! ```text
//! ┌───────┬─────────┬──────────────┬─────────────────────────┐
//! │ 0xA7  │ version │ len (u32 LE) │ bincode(PeerMessage)    │
//! └───────┴─────────┴──────────────┴─────────────────────────┘
//! ```
//!
//! Peer traffic shares the client port. No client request starts with
//! `0xA7`, so the first byte of a connection tells the two apart.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::engine::{Lsn, TransactionRecord};
use crate::error::{Result, SlateError};

/// First byte of every peer frame
pub const FRAME_MAGIC: u8 = 0xA7;
/// Current frame format version
pub const FRAME_VERSION: u8 = 1;
/// Largest accepted frame body
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Messages exchanged between primary and backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Primary -> backup: a committed transaction
    Commit(TransactionRecord),
    /// Backup -> primary: everything up to `commit_lsn` is applied
    Ack { commit_lsn: Lsn },
    /// Backup -> primary: send the transaction with this LSN next
    AskResend { commit_lsn: Lsn },
    /// Backup -> primary at startup: send every commit after `after_lsn`
    SyncRequest { after_lsn: Lsn },
    /// Primary -> backup: the commits asked for, in LSN order
    SyncResponse { records: Vec<TransactionRecord> },
}

impl PeerMessage {
    pub fn name(&self) -> &'static str {
        match self {
            PeerMessage::Commit(_) => "Commit",
            PeerMessage::Ack { .. } => "Ack",
            PeerMessage::AskResend { .. } => "AskResend",
            PeerMessage::SyncRequest { .. } => "SyncRequest",
            PeerMessage::SyncResponse { .. } => "SyncResponse",
        }
    }

    /// Encode as a complete frame
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let len = u32::try_from(body.len())
            .ok()
            .filter(|len| *len <= MAX_FRAME_LEN)
            .ok_or_else(|| {
                SlateError::Replication(format!("frame of {} bytes is too large", body.len()))
            })?;
        let mut frame = Vec::with_capacity(body.len() + 6);
        frame.push(FRAME_MAGIC);
        frame.push(FRAME_VERSION);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }
}

/// Write one framed message
pub async fn write_message<W>(writer: &mut W, message: &PeerMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = message.encode()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message. Returns `None` if the peer closed the
/// connection before sending anything.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<PeerMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 6];
    let first = reader.read(&mut header[..1]).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[1..]).await?;

    if header[0] != FRAME_MAGIC {
        return Err(SlateError::Replication(format!(
            "bad frame magic 0x{:02x}",
            header[0]
        )));
    }
    if header[1] != FRAME_VERSION {
        return Err(SlateError::Replication(format!(
            "unsupported frame version {}",
            header[1]
        )));
    }
    let len = u32::from_le_bytes([header[2], header[3], header[4], header[5]]);
    if len > MAX_FRAME_LEN {
        return Err(SlateError::Replication(format!(
            "frame of {} bytes is too large",
            len
        )));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    let message = bincode::deserialize(&body)?;
    Ok(Some(message))
}
