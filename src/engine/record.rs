//! Per-transaction state machine
//!
//! A `TransactionRecord` buffers the writes of one transaction keyed by
//! sequence number, tracks the commit bound announced by the client and the
//! terminal committed/aborted flags. It is pure in-memory state: durability
//! (WAL appends) and LSN allocation are driven by the commit coordinator,
//! which calls the `check_*` methods before logging and the mutating methods
//! after the log append succeeded.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SlateError};
use super::types::{Lsn, SeqNo, TxnId, TxnState};

/// Outcome of a COMMIT request against a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitRequest {
    /// Gaps below the bound; the client must resend these sequence numbers
    Missing(Vec<SeqNo>),
    /// All writes up to the bound are present, the commit can complete
    Ready,
    /// Already committed with the same bound; just acknowledge
    AlreadyCommitted,
}

/// Durable and replicated state of one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    id: TxnId,
    filename: String,
    writes: BTreeMap<SeqNo, Vec<u8>>,
    commit_bound: Option<SeqNo>,
    committed: bool,
    aborted: bool,
    flushed: bool,
    received_backup_ack: bool,
    commit_lsn: Option<Lsn>,
}

impl TransactionRecord {
    pub fn new(id: TxnId, filename: impl Into<String>) -> Self {
        Self {
            id,
            filename: filename.into(),
            writes: BTreeMap::new(),
            commit_bound: None,
            committed: false,
            aborted: false,
            flushed: false,
            received_backup_ack: false,
            commit_lsn: None,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn commit_bound(&self) -> Option<SeqNo> {
        self.commit_bound
    }

    pub fn commit_lsn(&self) -> Option<Lsn> {
        self.commit_lsn
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    pub fn received_commit_request(&self) -> bool {
        self.commit_bound.is_some()
    }

    pub fn received_backup_ack(&self) -> bool {
        self.received_backup_ack
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    pub fn contains(&self, seq: SeqNo) -> bool {
        self.writes.contains_key(&seq)
    }

    /// Current position in the state machine
    pub fn state(&self) -> TxnState {
        if self.aborted {
            TxnState::Aborted
        } else if self.committed {
            TxnState::Committed { flushed: self.flushed }
        } else if self.commit_bound.is_some() {
            TxnState::CommitRequested
        } else if self.writes.is_empty() {
            TxnState::Created
        } else {
            TxnState::Writing
        }
    }

    /// Validate a WRITE without mutating anything
    pub fn check_write(&self, seq: SeqNo) -> Result<()> {
        if self.committed || self.aborted {
            return Err(SlateError::InvalidOperation(format!(
                "TID: {} has already committed/aborted.",
                self.id
            )));
        }
        if seq == 0 {
            return Err(SlateError::InvalidOperation(
                "Sequence numbers for WRITE start at 1".to_string(),
            ));
        }
        if self.writes.contains_key(&seq) {
            return Err(SlateError::DuplicateSequence { txn_id: self.id, seq });
        }
        Ok(())
    }

    /// Buffer a write payload
    pub fn write(&mut self, seq: SeqNo, data: Vec<u8>) -> Result<()> {
        self.check_write(seq)?;
        self.writes.insert(seq, data);
        Ok(())
    }

    /// Handle a COMMIT request naming `seq` as the last sequence number.
    ///
    /// The first request fixes the bound; a later request with another bound
    /// fails without changing anything.
    pub fn request_commit(&mut self, seq: SeqNo) -> Result<CommitRequest> {
        if self.aborted {
            return Err(SlateError::InvalidOperation(format!(
                "TID:{} has aborted, you cannot commit an aborted transaction.",
                self.id
            )));
        }
        if self.committed {
            return match self.commit_bound {
                Some(bound) if bound != seq => Err(SlateError::InvalidOperation(format!(
                    "TID:{} has already commited with a different sequence number ({})",
                    self.id, bound
                ))),
                _ => Ok(CommitRequest::AlreadyCommitted),
            };
        }

        match self.commit_bound {
            Some(bound) if bound != seq => {
                return Err(SlateError::SequenceMismatch {
                    txn_id: self.id,
                    expected: bound,
                })
            }
            Some(_) => {}
            None => self.commit_bound = Some(seq),
        }

        let missing = self.missing_sequences();
        if missing.is_empty() {
            Ok(CommitRequest::Ready)
        } else {
            Ok(CommitRequest::Missing(missing))
        }
    }

    /// Sequence numbers in `1..=bound` that have not arrived yet
    pub fn missing_sequences(&self) -> Vec<SeqNo> {
        match self.commit_bound {
            Some(bound) => (1..=bound).filter(|s| !self.writes.contains_key(s)).collect(),
            None => Vec::new(),
        }
    }

    /// True when a commit request was seen and every write up to the bound is present
    pub fn is_commit_ready(&self) -> bool {
        !self.committed
            && !self.aborted
            && self.commit_bound.is_some()
            && self.missing_sequences().is_empty()
    }

    /// Validate that `complete_commit` would assign an LSN.
    /// Returns `Ok(false)` for an already committed record (acknowledge only).
    pub fn check_complete_commit(&self) -> Result<bool> {
        if self.committed {
            return Ok(false);
        }
        if self.aborted {
            return Err(SlateError::InvalidOperation(format!(
                "TID:{} has aborted, you cannot commit an aborted transaction.",
                self.id
            )));
        }
        if !self.is_commit_ready() {
            return Err(SlateError::InvalidOperation(format!(
                "TID:{} cannot commit, sequence numbers {:?} are missing",
                self.id,
                self.missing_sequences()
            )));
        }
        Ok(true)
    }

    /// Mark the record committed under `lsn`.
    /// Idempotent: a committed record keeps its original LSN and returns `Ok(false)`.
    pub fn complete_commit(&mut self, lsn: Lsn) -> Result<bool> {
        if !self.check_complete_commit()? {
            return Ok(false);
        }
        self.committed = true;
        self.commit_lsn = Some(lsn);
        Ok(true)
    }

    /// Validate an ABORT. Returns `Ok(false)` when already aborted.
    pub fn check_abort(&self) -> Result<bool> {
        if self.committed {
            return Err(SlateError::InvalidOperation(format!(
                "TID: {} has committed, you cannot ABORT a commited transaction.",
                self.id
            )));
        }
        Ok(!self.aborted)
    }

    pub fn abort(&mut self) -> Result<bool> {
        let changed = self.check_abort()?;
        self.aborted = true;
        Ok(changed)
    }

    pub fn mark_flushed(&mut self) {
        self.flushed = true;
    }

    pub fn mark_backup_ack(&mut self) {
        self.received_backup_ack = true;
    }

    /// Writes `1..=bound` in sequence order
    pub fn committed_writes(&self) -> impl Iterator<Item = (SeqNo, &[u8])> {
        let bound = self.commit_bound.unwrap_or(0);
        self.writes
            .iter()
            .take_while(move |(seq, _)| **seq <= bound)
            .map(|(seq, data)| (*seq, data.as_slice()))
    }

    /// Concatenation of writes `1..=bound`, the bytes appended to the file on commit
    pub fn committed_payload(&self) -> Result<Vec<u8>> {
        let missing = self.missing_sequences();
        if !missing.is_empty() {
            return Err(SlateError::InvalidOperation(format!(
                "TID:{} payload incomplete, missing {:?}",
                self.id, missing
            )));
        }
        let mut payload = Vec::new();
        for (_, data) in self.committed_writes() {
            payload.extend_from_slice(data);
        }
        Ok(payload)
    }

    /// Restore the committed state from a replayed COMMIT record
    pub(crate) fn restore_commit(&mut self, bound: SeqNo, lsn: Lsn) {
        self.commit_bound = Some(bound);
        self.committed = true;
        self.aborted = false;
        self.commit_lsn = Some(lsn);
    }

    /// Normalise a record received from the primary before the backup applies it
    pub(crate) fn into_replica(mut self) -> Self {
        if let Some(bound) = self.commit_bound {
            self.writes.retain(|seq, _| *seq <= bound);
        }
        self.flushed = false;
        self.received_backup_ack = true;
        self
    }
}
