//! Commit Coordinator for slatefs
//!
//! The coordinator owns every piece of shared engine state:
//!
//! - the transaction table (one lock per record)
//! - the LSN clock and the `commit LSN -> transaction` index
//! - the commit queue and its drain gate
//! - the file access table
//! - the WAL writer
//!
//! ### Commit Path
//! 1. COMMIT (or the WRITE closing the last gap) finds the record complete
//! 2. The LSN clock is locked, `COMMIT{flushed: false}` is appended and
//!    synced, only then does the clock advance
//! 3. The transaction is queued while the clock is still held, so queue
//!    order is LSN order
//! 4. A drain pass claims committed entries and materializes them under the
//!    file's exclusive writer slot; files claimed by another pass are left
//!    for that pass so each file sees its commits in LSN order
//! 5. The caller waits on the flushed signal until its record is flushed
//!
//! ### Startup
//! `open` runs WAL recovery, renames the recovery log over `.slatelog`, then
//! materializes commits that were logged but not flushed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::{Result, SlateError};
use crate::storage::{validate_filename, FileStore};
use super::access::FileAccessTable;
use super::entry::{LogOperation, LogRecord};
use super::queue::{CommitQueue, Disposition};
use super::record::{CommitRequest, TransactionRecord};
use super::recovery::RecoveryManager;
use super::types::{Lsn, SeqNo, TxnId};
use super::wal::{WalConfig, WalWriter};

#[cfg(test)]
mod tests;

/// Upper bound on how long a caller waits for its commit to reach the file
const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of a WRITE
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Buffered; no response is due
    Buffered,
    /// The write closed the last gap of a pending commit, which is now durable
    Committed { commit_lsn: Lsn },
}

/// Result of a COMMIT
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Gaps below the bound; ask the client to resend these
    Missing(Vec<SeqNo>),
    /// Durably applied. `newly` is false when the transaction was already committed.
    Committed { commit_lsn: Lsn, newly: bool },
}

/// Result of applying a record replicated from the primary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Applied and materialized
    Applied(Lsn),
    /// Out of order; this is the LSN we need next
    Expected(Lsn),
    /// Already applied earlier
    Duplicate(Lsn),
}

/// Wakes callers waiting for a commit to be flushed
#[derive(Debug, Default)]
struct FlushSignal {
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl FlushSignal {
    fn notify(&self) {
        let _guard = self.mutex.lock().expect("flush signal lock poisoned");
        self.condvar.notify_all();
    }
}

type SharedRecord = Arc<Mutex<TransactionRecord>>;

/// The Commit Coordinator
pub struct CommitCoordinator {
    store: FileStore,
    wal: WalWriter,
    /// Active and historical transactions
    txns: Mutex<HashMap<TxnId, SharedRecord>>,
    /// Last assigned commit LSN
    lsn: Mutex<Lsn>,
    /// Commit LSN -> transaction, kept for resends and sync
    commit_index: RwLock<BTreeMap<Lsn, TxnId>>,
    queue: CommitQueue,
    access: FileAccessTable,
    /// Files currently being materialized by some drain pass
    materializing: Mutex<HashSet<String>>,
    flushed: FlushSignal,
}

impl CommitCoordinator {
    /// Open the data directory, recover from the WAL and finish pending commits
    pub fn open(data_dir: impl Into<PathBuf>, config: WalConfig) -> Result<Self> {
        let store = FileStore::open(data_dir)?;
        let recovered = RecoveryManager::new(&store, config).recover()?;

        let access = FileAccessTable::with_files(store.list_files()?);
        for rec in recovered.txns.values() {
            access.register(rec.filename());
        }

        let txns = recovered
            .txns
            .into_iter()
            .map(|(id, rec)| (id, Arc::new(Mutex::new(rec))))
            .collect();

        let coordinator = Self {
            store,
            wal: recovered.wal,
            txns: Mutex::new(txns),
            lsn: Mutex::new(recovered.current_lsn),
            commit_index: RwLock::new(recovered.commit_index),
            queue: CommitQueue::new(),
            access,
            materializing: Mutex::new(HashSet::new()),
            flushed: FlushSignal::default(),
        };

        // The recovery log takes over before any flushed COMMIT is appended
        coordinator.wal.rename_to(coordinator.store.log_path())?;

        for txn_id in recovered.pending {
            log::info!("Materializing recovered commit of transaction {}", txn_id);
            coordinator.materialize(txn_id)?;
        }
        log::info!(
            "Commit coordinator ready: {} transactions, LSN {}",
            coordinator.transaction_count(),
            coordinator.current_lsn()
        );
        Ok(coordinator)
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub fn access_table(&self) -> &FileAccessTable {
        &self.access
    }

    /// Last assigned commit LSN
    pub fn current_lsn(&self) -> Lsn {
        *self.lsn.lock().expect("LSN clock lock poisoned")
    }

    pub fn transaction_count(&self) -> usize {
        self.txns.lock().expect("transaction table lock poisoned").len()
    }

    /// Number of commits waiting to be drained
    pub fn pending_commits(&self) -> usize {
        self.queue.len()
    }

    /// Start a transaction against `filename`
    pub fn new_transaction(&self, filename: &str) -> Result<TxnId> {
        validate_filename(filename)?;

        let txn_id = {
            let mut txns = self.txns.lock().expect("transaction table lock poisoned");
            let mut rng = rand::thread_rng();
            let mut txn_id: TxnId = rng.gen_range(1..=i32::MAX as TxnId);
            while txns.contains_key(&txn_id) {
                txn_id = rng.gen_range(1..=i32::MAX as TxnId);
            }
            txns.insert(
                txn_id,
                Arc::new(Mutex::new(TransactionRecord::new(txn_id, filename))),
            );
            txn_id
        };

        let record = LogRecord::new(
            txn_id,
            LogOperation::NewTxn {
                filename: filename.to_string(),
            },
        );
        if let Err(e) = self.wal.append(record) {
            self.txns
                .lock()
                .expect("transaction table lock poisoned")
                .remove(&txn_id);
            return Err(e);
        }

        self.access.register(filename);
        log::debug!("Transaction {} started on {}", txn_id, filename);
        Ok(txn_id)
    }

    /// Buffer a write. Completes the commit when it closes the last gap.
    pub fn write(&self, txn_id: TxnId, seq: SeqNo, data: Vec<u8>) -> Result<WriteOutcome> {
        let shared = self.record(txn_id)?;
        let committed = {
            let mut rec = shared.lock().expect("transaction record lock poisoned");
            rec.check_write(seq)?;
            self.wal.append(LogRecord::new(
                txn_id,
                LogOperation::Write {
                    seq,
                    data: data.clone(),
                },
            ))?;
            rec.write(seq, data)?;

            if rec.received_commit_request() && rec.is_commit_ready() {
                self.complete_commit(&mut rec)?
            } else {
                None
            }
        };

        match committed {
            Some(commit_lsn) => {
                self.settle(txn_id)?;
                Ok(WriteOutcome::Committed { commit_lsn })
            }
            None => Ok(WriteOutcome::Buffered),
        }
    }

    /// Handle a COMMIT naming `seq` as the last sequence number
    pub fn request_commit(&self, txn_id: TxnId, seq: SeqNo) -> Result<CommitOutcome> {
        let shared = self.record(txn_id)?;
        let (commit_lsn, newly) = {
            let mut rec = shared.lock().expect("transaction record lock poisoned");
            match rec.request_commit(seq)? {
                CommitRequest::Missing(missing) => return Ok(CommitOutcome::Missing(missing)),
                CommitRequest::AlreadyCommitted => match rec.commit_lsn() {
                    Some(lsn) => (lsn, false),
                    None => {
                        return Err(SlateError::InvalidOperation(format!(
                            "TID:{} is committed without a commit LSN",
                            txn_id
                        )))
                    }
                },
                CommitRequest::Ready => match self.complete_commit(&mut rec)? {
                    Some(lsn) => (lsn, true),
                    None => (rec.commit_lsn().unwrap_or_default(), false),
                },
            }
        };

        if !newly {
            // A repeated COMMIT may race a materialization still in flight
            let flushed = shared
                .lock()
                .expect("transaction record lock poisoned")
                .is_flushed();
            if !flushed {
                self.queue.push(txn_id);
            }
        }
        self.settle(txn_id)?;
        Ok(CommitOutcome::Committed { commit_lsn, newly })
    }

    /// Abort a transaction. Returns false if it was already aborted.
    pub fn abort(&self, txn_id: TxnId) -> Result<bool> {
        let shared = self.record(txn_id)?;
        let mut rec = shared.lock().expect("transaction record lock poisoned");
        if !rec.check_abort()? {
            return Ok(false);
        }
        self.wal.append(LogRecord::new(txn_id, LogOperation::Abort))?;
        rec.abort()?;
        log::debug!("Transaction {} aborted", txn_id);
        Ok(true)
    }

    /// Full content of a file, read under the file's shared slot
    pub fn read_file(&self, filename: &str) -> Result<Vec<u8>> {
        validate_filename(filename)?;
        let _guard = self.access.acquire_read(filename);
        self.store.read(filename)
    }

    /// Assign the next commit LSN to a complete record and log it.
    /// The record must be locked by the caller. Returns `None` when already committed.
    fn complete_commit(&self, rec: &mut TransactionRecord) -> Result<Option<Lsn>> {
        if !rec.check_complete_commit()? {
            return Ok(None);
        }
        let bound = rec.commit_bound().unwrap_or_default();

        let mut clock = self.lsn.lock().expect("LSN clock lock poisoned");
        let commit_lsn = *clock + 1;
        self.wal.append(LogRecord::new(
            rec.id(),
            LogOperation::Commit {
                bound,
                commit_lsn,
                flushed: false,
            },
        ))?;
        *clock = commit_lsn;
        rec.complete_commit(commit_lsn)?;
        self.commit_index
            .write()
            .expect("commit index lock poisoned")
            .insert(commit_lsn, rec.id());
        self.queue.push(rec.id());
        drop(clock);

        log::debug!("Transaction {} committed at LSN {}", rec.id(), commit_lsn);
        Ok(Some(commit_lsn))
    }

    /// Drain the queue and wait until `txn_id` is flushed
    fn settle(&self, txn_id: TxnId) -> Result<()> {
        self.process_commits()?;
        self.wait_flushed(txn_id, FLUSH_TIMEOUT)
    }

    /// Drain the commit queue until no entry can be claimed.
    /// Returns the number of transactions materialized by this call.
    pub fn process_commits(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let mut pass_files: HashSet<String> = HashSet::new();
            let claimed = self.queue.drain(|txn_id| self.classify(txn_id, &mut pass_files));
            if claimed.is_empty() {
                return Ok(total);
            }

            let mut failure = None;
            for txn_id in claimed {
                if failure.is_some() {
                    self.queue.push(txn_id);
                    continue;
                }
                match self.materialize(txn_id) {
                    Ok(()) => total += 1,
                    Err(e) => {
                        log::error!("Failed to materialize transaction {}: {}", txn_id, e);
                        self.queue.push(txn_id);
                        failure = Some(e);
                    }
                }
            }

            {
                let mut busy = self.materializing.lock().expect("materializing lock poisoned");
                for filename in &pass_files {
                    busy.remove(filename);
                }
            }

            if let Some(e) = failure {
                return Err(e);
            }
        }
    }

    /// Decide what the current drain pass does with one queue entry
    fn classify(&self, txn_id: TxnId, pass_files: &mut HashSet<String>) -> Disposition {
        let shared = match self.record(txn_id) {
            Ok(shared) => shared,
            Err(e) => {
                log::debug!("Dropping queued commit: {}", e);
                return Disposition::Drop;
            }
        };
        let rec = shared.lock().expect("transaction record lock poisoned");
        if rec.is_aborted() || rec.is_flushed() {
            return Disposition::Drop;
        }
        if !rec.is_committed() {
            return Disposition::Keep;
        }

        let filename = rec.filename();
        if pass_files.contains(filename) {
            return Disposition::Claim;
        }
        let mut busy = self.materializing.lock().expect("materializing lock poisoned");
        if busy.contains(filename) {
            // The pass holding this file drains again when it is done
            return Disposition::Keep;
        }
        busy.insert(filename.to_string());
        pass_files.insert(filename.to_string());
        Disposition::Claim
    }

    /// Apply a committed transaction to its file.
    ///
    /// Stages live content plus payload, logs the flushed COMMIT, then
    /// renames the staging file over the live file. No-op when already flushed.
    pub fn materialize(&self, txn_id: TxnId) -> Result<()> {
        let shared = self.record(txn_id)?;
        let filename = shared
            .lock()
            .expect("transaction record lock poisoned")
            .filename()
            .to_string();

        let _guard = self.access.acquire_write(&filename);

        let (payload, bound, commit_lsn) = {
            let rec = shared.lock().expect("transaction record lock poisoned");
            if rec.is_flushed() {
                return Ok(());
            }
            let commit_lsn = rec.commit_lsn().ok_or_else(|| {
                SlateError::InvalidOperation(format!("TID:{} has not committed", txn_id))
            })?;
            (
                rec.committed_payload()?,
                rec.commit_bound().unwrap_or_default(),
                commit_lsn,
            )
        };

        self.store.stage(txn_id, &filename, &payload)?;
        self.wal.append(LogRecord::new(
            txn_id,
            LogOperation::Commit {
                bound,
                commit_lsn,
                flushed: true,
            },
        ))?;
        self.store.publish(txn_id, &filename)?;

        shared
            .lock()
            .expect("transaction record lock poisoned")
            .mark_flushed();
        self.flushed.notify();
        log::debug!(
            "Transaction {} flushed to {} ({} bytes)",
            txn_id,
            filename,
            payload.len()
        );
        Ok(())
    }

    /// Block until `txn_id` is flushed, or fail after `timeout`
    pub fn wait_flushed(&self, txn_id: TxnId, timeout: Duration) -> Result<()> {
        let shared = self.record(txn_id)?;
        let is_flushed = || {
            shared
                .lock()
                .expect("transaction record lock poisoned")
                .is_flushed()
        };

        let deadline = Instant::now() + timeout;
        let mut guard = self.flushed.mutex.lock().expect("flush signal lock poisoned");
        loop {
            if is_flushed() {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SlateError::Timeout(format!(
                    "TID:{} was not flushed within {:?}",
                    txn_id, timeout
                )));
            }
            let (next, _) = self
                .flushed
                .condvar
                .wait_timeout(guard, remaining)
                .expect("flush signal lock poisoned");
            guard = next;
        }
    }

    /// Record that the backup acknowledged this transaction
    pub fn mark_backup_ack(&self, txn_id: TxnId) -> Result<()> {
        let shared = self.record(txn_id)?;
        shared
            .lock()
            .expect("transaction record lock poisoned")
            .mark_backup_ack();
        Ok(())
    }

    /// Copy of a transaction's current state
    pub fn snapshot(&self, txn_id: TxnId) -> Result<TransactionRecord> {
        let shared = self.record(txn_id)?;
        let rec = shared.lock().expect("transaction record lock poisoned");
        Ok(rec.clone())
    }

    /// Copy of the whole transaction table, ordered by ID
    pub fn table_snapshot(&self) -> BTreeMap<TxnId, TransactionRecord> {
        let records: Vec<SharedRecord> = self
            .txns
            .lock()
            .expect("transaction table lock poisoned")
            .values()
            .cloned()
            .collect();
        records
            .iter()
            .map(|shared| {
                let rec = shared.lock().expect("transaction record lock poisoned");
                (rec.id(), rec.clone())
            })
            .collect()
    }

    /// The committed transaction carrying `commit_lsn`
    pub fn record_by_lsn(&self, commit_lsn: Lsn) -> Option<TransactionRecord> {
        let txn_id = *self
            .commit_index
            .read()
            .expect("commit index lock poisoned")
            .get(&commit_lsn)?;
        self.snapshot(txn_id).ok()
    }

    /// Committed transactions with a commit LSN above `after`, in LSN order
    pub fn records_after(&self, after: Lsn) -> Vec<TransactionRecord> {
        let ids: Vec<TxnId> = self
            .commit_index
            .read()
            .expect("commit index lock poisoned")
            .range(after.saturating_add(1)..)
            .map(|(_, id)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.snapshot(id).ok())
            .collect()
    }

    /// Apply a committed transaction received from the primary.
    ///
    /// Records must arrive in LSN order: anything beyond `current + 1` is
    /// answered with the LSN we expect instead.
    pub fn apply_replicated(&self, record: TransactionRecord) -> Result<ApplyOutcome> {
        let commit_lsn = match (record.is_committed(), record.commit_lsn()) {
            (true, Some(lsn)) => lsn,
            _ => {
                return Err(SlateError::Replication(format!(
                    "TID:{} arrived without a commit",
                    record.id()
                )))
            }
        };
        validate_filename(record.filename())?;
        let record = record.into_replica();
        let txn_id = record.id();

        {
            let mut clock = self.lsn.lock().expect("LSN clock lock poisoned");
            if commit_lsn <= *clock {
                return Ok(ApplyOutcome::Duplicate(commit_lsn));
            }
            if commit_lsn > *clock + 1 {
                return Ok(ApplyOutcome::Expected(*clock + 1));
            }

            let mut entries = vec![LogRecord::new(
                txn_id,
                LogOperation::NewTxn {
                    filename: record.filename().to_string(),
                },
            )];
            for (seq, data) in record.committed_writes() {
                entries.push(LogRecord::new(
                    txn_id,
                    LogOperation::Write {
                        seq,
                        data: data.to_vec(),
                    },
                ));
            }
            entries.push(LogRecord::new(
                txn_id,
                LogOperation::Commit {
                    bound: record.commit_bound().unwrap_or_default(),
                    commit_lsn,
                    flushed: false,
                },
            ));
            self.wal.append_all(entries)?;

            *clock = commit_lsn;
            self.access.register(record.filename());
            let replaced = self
                .txns
                .lock()
                .expect("transaction table lock poisoned")
                .insert(txn_id, Arc::new(Mutex::new(record)));
            if replaced.is_some() {
                log::warn!("Replicated transaction {} replaced a local record", txn_id);
            }
            self.commit_index
                .write()
                .expect("commit index lock poisoned")
                .insert(commit_lsn, txn_id);
            self.queue.push(txn_id);
        }

        self.settle(txn_id)?;
        log::debug!("Applied replicated transaction {} at LSN {}", txn_id, commit_lsn);
        Ok(ApplyOutcome::Applied(commit_lsn))
    }

    fn record(&self, txn_id: TxnId) -> Result<SharedRecord> {
        self.txns
            .lock()
            .expect("transaction table lock poisoned")
            .get(&txn_id)
            .cloned()
            .ok_or(SlateError::InvalidTransactionId(txn_id as i64))
    }
}
