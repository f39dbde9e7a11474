//! WAL record structures and line encoding
//!
//! Each record occupies one line of the log:
//!
//! ```text
//! hex( crc32(body) as 4 LE bytes ‖ body )   where body = bincode(LogRecord)
//! ```
//!
//! Hex keeps the log line-oriented (payload bytes may contain newlines) and
//! the checksum lets recovery tell a torn final line from valid data.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SlateError};
use super::types::{Lsn, SeqNo, TxnId};

/// A WAL log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Transaction ID
    pub txn_id: TxnId,
    /// The operation
    pub op: LogOperation,
    /// Timestamp (Unix epoch millis)
    pub timestamp: u64,
}

/// Operations that can be logged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOperation {
    /// Transaction created against a file
    NewTxn { filename: String },
    /// Buffered write
    Write { seq: SeqNo, data: Vec<u8> },
    /// Transaction aborted
    Abort,
    /// Transaction committed. Logged once with `flushed: false` when the LSN
    /// is assigned and again with `flushed: true` once the staging file is durable.
    Commit {
        bound: SeqNo,
        commit_lsn: Lsn,
        flushed: bool,
    },
}

impl LogRecord {
    pub fn new(txn_id: TxnId, op: LogOperation) -> Self {
        Self {
            txn_id,
            op,
            timestamp: timestamp_millis(),
        }
    }

    /// Encode as a single log line (without the trailing newline)
    pub fn encode_line(&self) -> Result<String> {
        let body = bincode::serialize(self)?;
        let mut framed = Vec::with_capacity(body.len() + 4);
        framed.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        framed.extend_from_slice(&body);
        Ok(hex::encode(framed))
    }

    /// Decode one log line produced by `encode_line`
    pub fn decode_line(line: &str) -> Result<Self> {
        let framed = hex::decode(line.trim_end())
            .map_err(|e| SlateError::WalCorruption(format!("invalid hex: {}", e)))?;
        if framed.len() < 4 {
            return Err(SlateError::WalCorruption("record shorter than checksum".into()));
        }
        let (crc, body) = framed.split_at(4);
        let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        if crc32fast::hash(body) != expected {
            return Err(SlateError::WalCorruption("checksum mismatch".into()));
        }
        bincode::deserialize(body)
            .map_err(|e| SlateError::WalCorruption(format!("undecodable record: {}", e)))
    }
}

/// Current timestamp in milliseconds
fn timestamp_millis() -> u64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(dur) => dur.as_millis() as u64,
        Err(_) => 0,
    }
}
