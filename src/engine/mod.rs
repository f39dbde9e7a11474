//! Transaction and commit engine
//!
//! - `record`: per-transaction state machine
//! - `entry`, `wal`, `recovery`: write-ahead log and replay
//! - `access`: per-file reader/writer admission
//! - `queue`: commit queue with its drain gate
//! - `manager`: the commit coordinator tying them together

pub mod access;
pub mod entry;
pub mod manager;
pub mod queue;
pub mod record;
pub mod recovery;
pub mod types;
pub mod wal;

pub use access::{FileAccessTable, ReadGuard, WriteGuard};
pub use entry::{LogOperation, LogRecord};
pub use manager::{ApplyOutcome, CommitCoordinator, CommitOutcome, WriteOutcome};
pub use record::{CommitRequest, TransactionRecord};
pub use recovery::{RecoveryManager, RecoveryStats};
pub use types::{Lsn, SeqNo, TxnId, TxnState};
pub use wal::{WalConfig, WalWriter};
