//! Transaction recovery and WAL replay logic
//!
//! Recovery rebuilds the transaction table from `.slatelog`:
//!
//! 1. Read every line of the log; a torn final line is dropped, any other
//!    undecodable line aborts startup
//! 2. Replay records in order and re-append each applied record to a fresh
//!    recovery log
//! 3. A flushed COMMIT whose staging file survived the crash is published
//! 4. Remaining staging files belong to commits that never reached their
//!    flushed record and are deleted
//!
//! Committed but unflushed transactions are handed back as pending flush
//! jobs; the coordinator materializes them and then renames the recovery log
//! over `.slatelog`.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;

use crate::error::{Result, SlateError};
use crate::storage::FileStore;
use super::entry::{LogOperation, LogRecord};
use super::record::TransactionRecord;
use super::types::{Lsn, TxnId};
use super::wal::{WalConfig, WalWriter};

/// Counters reported at the end of recovery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub records_replayed: usize,
    pub records_skipped: usize,
    pub staging_published: usize,
    pub staging_removed: usize,
    pub torn_tail: bool,
}

/// State rebuilt from the log
pub struct RecoveredState {
    /// Writer appending to the recovery log
    pub wal: WalWriter,
    pub txns: HashMap<TxnId, TransactionRecord>,
    pub commit_index: BTreeMap<Lsn, TxnId>,
    pub current_lsn: Lsn,
    /// Committed but not flushed, in LSN order
    pub pending: Vec<TxnId>,
    pub stats: RecoveryStats,
}

/// Recovery state tracker
pub struct RecoveryManager<'a> {
    store: &'a FileStore,
    config: WalConfig,
}

impl<'a> RecoveryManager<'a> {
    pub fn new(store: &'a FileStore, config: WalConfig) -> Self {
        Self { store, config }
    }

    /// Recover from the WAL on startup
    pub fn recover(&self) -> Result<RecoveredState> {
        let records = self.read_log()?;

        // Truncates any recovery log left by an earlier failed startup
        let wal = WalWriter::open(self.store.recovery_log_path(), self.config.clone(), true)?;

        let mut txns: HashMap<TxnId, TransactionRecord> = HashMap::new();
        let mut commit_index: BTreeMap<Lsn, TxnId> = BTreeMap::new();
        let mut pending: BTreeMap<Lsn, TxnId> = BTreeMap::new();
        let mut current_lsn: Lsn = 0;
        let mut stats = RecoveryStats {
            torn_tail: records.torn_tail,
            ..RecoveryStats::default()
        };
        let mut kept = Vec::with_capacity(records.records.len());

        if !records.records.is_empty() {
            log::info!("Starting recovery: {} WAL records", records.records.len());
        }

        for record in records.records {
            let txn_id = record.txn_id;
            let applied = match &record.op {
                LogOperation::NewTxn { filename } => {
                    if txns.contains_key(&txn_id) {
                        log::warn!("Duplicate NEW_TXN for transaction {} in WAL", txn_id);
                        false
                    } else {
                        txns.insert(txn_id, TransactionRecord::new(txn_id, filename.clone()));
                        true
                    }
                }
                LogOperation::Write { seq, data } => match txns.get_mut(&txn_id) {
                    Some(rec) => match rec.write(*seq, data.clone()) {
                        Ok(()) => true,
                        Err(e) => {
                            log::warn!("Skipping WAL write for transaction {}: {}", txn_id, e);
                            false
                        }
                    },
                    None => {
                        log::warn!("WAL write for unknown transaction {}", txn_id);
                        false
                    }
                },
                LogOperation::Abort => match txns.get_mut(&txn_id) {
                    Some(rec) => match rec.abort() {
                        Ok(_) => true,
                        Err(e) => {
                            log::warn!("Skipping WAL abort for transaction {}: {}", txn_id, e);
                            false
                        }
                    },
                    None => {
                        log::warn!("WAL abort for unknown transaction {}", txn_id);
                        false
                    }
                },
                LogOperation::Commit {
                    bound,
                    commit_lsn,
                    flushed,
                } => match txns.get_mut(&txn_id) {
                    Some(rec) => {
                        rec.restore_commit(*bound, *commit_lsn);
                        commit_index.insert(*commit_lsn, txn_id);
                        current_lsn = current_lsn.max(*commit_lsn);
                        if *flushed {
                            rec.mark_flushed();
                            pending.remove(commit_lsn);
                            if self.store.has_staging(txn_id, rec.filename()) {
                                log::info!(
                                    "Completing interrupted commit of transaction {} to {}",
                                    txn_id,
                                    rec.filename()
                                );
                                self.store.publish(txn_id, rec.filename())?;
                                stats.staging_published += 1;
                            }
                        } else if !rec.is_flushed() {
                            pending.insert(*commit_lsn, txn_id);
                        }
                        true
                    }
                    None => {
                        log::warn!("WAL commit for unknown transaction {}", txn_id);
                        false
                    }
                },
            };

            if applied {
                stats.records_replayed += 1;
                kept.push(record);
            } else {
                stats.records_skipped += 1;
            }
        }

        // Orphans: staging files of commits that never logged their flushed record
        for staged in self.store.staging_files()? {
            log::debug!("Removing stale staging file {}", staged.path.display());
            self.store.remove(&staged.path)?;
            stats.staging_removed += 1;
        }

        wal.append_all(kept)?;

        if stats.records_replayed > 0 || stats.records_skipped > 0 {
            log::info!(
                "Recovery replayed {} records ({} skipped), LSN {}, {} pending flushes",
                stats.records_replayed,
                stats.records_skipped,
                current_lsn,
                pending.len()
            );
        }

        Ok(RecoveredState {
            wal,
            txns,
            commit_index,
            current_lsn,
            pending: pending.into_values().collect(),
            stats,
        })
    }

    fn read_log(&self) -> Result<DecodedLog> {
        let bytes = match fs::read(self.store.log_path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(DecodedLog::default()),
            Err(e) => return Err(e.into()),
        };
        decode_log(&bytes)
    }
}

#[derive(Debug, Default)]
struct DecodedLog {
    records: Vec<LogRecord>,
    torn_tail: bool,
}

/// Decode a whole log. Only the last non-empty line may be damaged.
fn decode_log(bytes: &[u8]) -> Result<DecodedLog> {
    let lines: Vec<&[u8]> = bytes
        .split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(|b| b.is_ascii_whitespace()))
        .collect();

    let mut decoded = DecodedLog::default();
    let last = lines.len().saturating_sub(1);
    for (i, line) in lines.iter().enumerate() {
        let result = std::str::from_utf8(line)
            .map_err(|e| SlateError::WalCorruption(format!("non-text line: {}", e)))
            .and_then(LogRecord::decode_line);
        match result {
            Ok(record) => decoded.records.push(record),
            Err(e) if i == last => {
                log::warn!("Discarding torn WAL tail: {}", e);
                decoded.torn_tail = true;
            }
            Err(e) => {
                return Err(SlateError::WalCorruption(format!(
                    "line {} of {}: {}",
                    i + 1,
                    lines.len(),
                    e
                )))
            }
        }
    }
    Ok(decoded)
}
