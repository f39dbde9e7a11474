//! Commit queue with a drain gate
//!
//! Transactions enter the queue when their COMMIT request arrives. A drain
//! pass closes the gate, decides for every entry whether to claim it, drop it
//! or leave it, removes claimed and dropped entries, and opens the gate again.
//! Insertions and removals wait while the gate is closed, so two passes never
//! see the same entry.

use std::sync::{Condvar, Mutex};

use super::types::TxnId;

/// What a drain pass does with one queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Ready: remove from the queue and hand to the caller
    Claim,
    /// Nothing left to do (flushed, aborted, unknown): remove
    Drop,
    /// Not ready yet: leave for a later pass
    Keep,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: Vec<TxnId>,
    commit_in_progress: bool,
}

#[derive(Debug, Default)]
pub struct CommitQueue {
    state: Mutex<QueueState>,
    gate: Condvar,
}

impl CommitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transaction (no-op if already queued)
    pub fn push(&self, txn_id: TxnId) {
        let mut state = self.wait_for_gate();
        if !state.pending.contains(&txn_id) {
            state.pending.push(txn_id);
        }
    }

    pub fn len(&self) -> usize {
        let state = self.wait_for_gate();
        state.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run one drain pass. `classify` is called for every queued entry in
    /// insertion order without the queue lock held; the claimed entries are
    /// returned in the same order.
    pub fn drain<F>(&self, mut classify: F) -> Vec<TxnId>
    where
        F: FnMut(TxnId) -> Disposition,
    {
        let snapshot = {
            let mut state = self.wait_for_gate();
            state.commit_in_progress = true;
            state.pending.clone()
        };

        let mut claimed = Vec::new();
        let mut removed = Vec::new();
        for txn_id in snapshot {
            match classify(txn_id) {
                Disposition::Claim => {
                    claimed.push(txn_id);
                    removed.push(txn_id);
                }
                Disposition::Drop => removed.push(txn_id),
                Disposition::Keep => {}
            }
        }

        let mut state = self.state.lock().expect("commit queue lock poisoned");
        state.pending.retain(|id| !removed.contains(id));
        state.commit_in_progress = false;
        self.gate.notify_all();
        claimed
    }

    fn wait_for_gate(&self) -> std::sync::MutexGuard<'_, QueueState> {
        let mut state = self.state.lock().expect("commit queue lock poisoned");
        while state.commit_in_progress {
            state = self.gate.wait(state).expect("commit queue lock poisoned");
        }
        state
    }
}
