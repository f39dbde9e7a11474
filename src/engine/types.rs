//! Core transaction identifiers and state

/// Log Sequence Number - commit ordering key and replication cursor
pub type Lsn = u64;

/// Transaction ID
pub type TxnId = u64;

/// Client-supplied write sequence number (starts at 1)
pub type SeqNo = u64;

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Created by NEW_TXN, no writes buffered yet
    Created,
    /// At least one write buffered, no COMMIT seen
    Writing,
    /// COMMIT received, waiting for missing writes
    CommitRequested,
    /// Commit LSN assigned; `flushed` tells whether the file reflects it
    Committed { flushed: bool },
    Aborted,
}

impl TxnState {
    /// Committed and aborted are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxnState::Committed { .. } | TxnState::Aborted)
    }
}
