//! Write-Ahead Log writer thread
//!
//! All appends go through a single worker thread that owns the log file.
//! Callers block until their records have been written *and* fsynced:
//!
//! - Requests arriving within `batch_timeout_ms` of each other are written
//!   together and share one `sync_data` (group commit)
//! - Every caller in a batch is answered only after that fsync succeeds
//! - A failed write or fsync is reported to every caller of the batch and
//!   the file is cut back to its length before the batch, so no partial or
//!   unacknowledged line stays in the log
//! - If that rollback fails too, the writer refuses every later append
//!
//! The worker can also rename the file it is appending to. Recovery uses
//! that to atomically take over the primary log name with the freshly
//! written recovery log while keeping the same file handle open.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::error::{Result, SlateError};
use super::entry::LogRecord;

/// Configuration for WAL group commit.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Maximum time to keep collecting requests into a batch (milliseconds)
    pub batch_timeout_ms: u64,
    /// Maximum number of requests in a batch before forcing the write
    pub max_batch_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            batch_timeout_ms: 2,
            max_batch_size: 128,
        }
    }
}

impl WalConfig {
    /// One fsync per request, no batching window
    pub fn synchronous() -> Self {
        Self {
            batch_timeout_ms: 0,
            max_batch_size: 1,
        }
    }
}

/// A request to append records (all or nothing, one fsync)
pub struct AppendRequest {
    pub records: Vec<LogRecord>,
    pub responder: mpsc::SyncSender<Result<()>>,
}

/// Control messages for the WAL worker thread.
pub enum WalMessage {
    Append(AppendRequest),
    /// Rename the open log file; appends continue on the same handle
    Rename(PathBuf, mpsc::SyncSender<Result<()>>),
    Shutdown,
}

/// Handle to the WAL worker thread
pub struct WalWriter {
    sender: mpsc::SyncSender<WalMessage>,
}

impl WalWriter {
    /// Open (creating if needed) the log at `path` and spawn the worker.
    /// With `truncate` any previous content is discarded.
    pub fn open(path: PathBuf, config: WalConfig, truncate: bool) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.create(true);
        if truncate {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        let file = options.open(&path)?;

        let (tx, rx) = mpsc::sync_channel::<WalMessage>(10000);

        std::thread::Builder::new()
            .name("slatefs-wal".to_string())
            .spawn(move || wal_worker_thread(file, path, rx, config))?;

        Ok(Self { sender: tx })
    }

    /// Append one record and wait until it is durable
    pub fn append(&self, record: LogRecord) -> Result<()> {
        self.append_all(vec![record])
    }

    /// Append several records with a single fsync and wait until they are durable
    pub fn append_all(&self, records: Vec<LogRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let (tx, rx) = mpsc::sync_channel(1);
        self.sender
            .send(WalMessage::Append(AppendRequest {
                records,
                responder: tx,
            }))
            .map_err(|e| worker_gone(format!("WAL worker channel closed: {}", e)))?;

        rx.recv()
            .map_err(|e| worker_gone(format!("WAL worker response lost: {}", e)))?
    }

    /// Rename the log file the worker is appending to
    pub fn rename_to(&self, to: PathBuf) -> Result<()> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.sender
            .send(WalMessage::Rename(to, tx))
            .map_err(|e| worker_gone(format!("WAL worker channel closed: {}", e)))?;

        rx.recv()
            .map_err(|e| worker_gone(format!("WAL rename response lost: {}", e)))?
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        let _ = self.sender.send(WalMessage::Shutdown);
    }
}

fn worker_gone(msg: String) -> SlateError {
    SlateError::Io(io::Error::new(io::ErrorKind::Other, msg))
}

/// Outcome of a failed append
#[derive(Debug)]
enum BatchFailure {
    /// The file is back at its length before the append
    RolledBack(SlateError),
    /// The file could not be cut back and may end in a partial line
    Broken(SlateError),
}

/// WAL worker thread - batches appends and fsyncs once per batch
fn wal_worker_thread(
    mut file: File,
    mut path: PathBuf,
    rx: mpsc::Receiver<WalMessage>,
    config: WalConfig,
) {
    let batch_timeout = Duration::from_millis(config.batch_timeout_ms);
    let max_batch_size = config.max_batch_size.max(1);
    let mut broken: Option<String> = None;

    loop {
        let mut batch: Vec<AppendRequest> = Vec::new();
        let mut pending_renames: Vec<(PathBuf, mpsc::SyncSender<Result<()>>)> = Vec::new();
        let mut should_shutdown = false;

        // Block for the first message
        match rx.recv() {
            Ok(WalMessage::Append(req)) => batch.push(req),
            Ok(WalMessage::Rename(to, responder)) => pending_renames.push((to, responder)),
            Ok(WalMessage::Shutdown) => should_shutdown = true,
            Err(_) => {
                log::debug!("WAL worker shutting down (channel closed)");
                break;
            }
        }

        // Collect additional appends up to the batch window
        let deadline = Instant::now() + batch_timeout;
        while !batch.is_empty()
            && pending_renames.is_empty()
            && batch.len() < max_batch_size
            && !should_shutdown
        {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok(WalMessage::Append(req)) => batch.push(req),
                Ok(WalMessage::Rename(to, responder)) => pending_renames.push((to, responder)),
                Ok(WalMessage::Shutdown) => should_shutdown = true,
                Err(mpsc::RecvTimeoutError::Timeout) => break,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        if !batch.is_empty() {
            let batch_size = batch.len();
            let result = match &broken {
                Some(reason) => Err(format!("WAL unusable after failed rollback: {}", reason)),
                None => match write_batch(&mut file, &batch) {
                    Ok(count) => {
                        if batch_size > 1 {
                            log::debug!("WAL batch synced: {} requests, {} records", batch_size, count);
                        }
                        Ok(())
                    }
                    Err(BatchFailure::RolledBack(e)) => {
                        log::error!("WAL append failed, batch rolled back: {}", e);
                        Err(e.to_string())
                    }
                    Err(BatchFailure::Broken(e)) => {
                        log::error!("WAL append failed and could not be rolled back: {}", e);
                        broken = Some(e.to_string());
                        Err(e.to_string())
                    }
                },
            };
            for req in batch {
                let reply = result
                    .clone()
                    .map_err(|msg| SlateError::Io(io::Error::new(io::ErrorKind::Other, msg)));
                let _ = req.responder.send(reply);
            }
        }

        for (to, responder) in pending_renames {
            let result = perform_rename(&file, &path, &to);
            if result.is_ok() {
                log::debug!("WAL renamed {} -> {}", path.display(), to.display());
                path = to;
            }
            let _ = responder.send(result);
        }

        if should_shutdown {
            let _ = file.sync_data();
            log::debug!("WAL worker shutting down (shutdown message)");
            break;
        }
    }
}

/// Write every record of the batch as one line each, then fsync once.
/// Returns the number of records written.
fn write_batch(file: &mut File, batch: &[AppendRequest]) -> std::result::Result<usize, BatchFailure> {
    let mut buf = String::new();
    let mut count = 0;
    for req in batch {
        for record in &req.records {
            let line = record.encode_line().map_err(BatchFailure::RolledBack)?;
            buf.push_str(&line);
            buf.push('\n');
            count += 1;
        }
    }
    append_durably(file, buf.as_bytes(), |file, bytes| {
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_data()
    })?;
    Ok(count)
}

/// Run `write` against the end of `file`. On failure the file is truncated
/// back to its previous length and synced.
fn append_durably<F>(file: &mut File, bytes: &[u8], write: F) -> std::result::Result<(), BatchFailure>
where
    F: FnOnce(&mut File, &[u8]) -> io::Result<()>,
{
    let start = file
        .metadata()
        .map_err(|e| BatchFailure::RolledBack(e.into()))?
        .len();
    let err = match write(file, bytes) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    match rollback(file, start) {
        Ok(()) => Err(BatchFailure::RolledBack(err.into())),
        Err(rollback_err) => Err(BatchFailure::Broken(SlateError::Io(io::Error::new(
            err.kind(),
            format!("{} (rollback failed: {})", err, rollback_err),
        )))),
    }
}

fn rollback(file: &mut File, len: u64) -> io::Result<()> {
    file.set_len(len)?;
    file.seek(SeekFrom::Start(len))?;
    file.sync_data()
}

/// Sync the current file, rename it, and sync the parent directory so the new
/// name is durable.
fn perform_rename(file: &File, from: &Path, to: &Path) -> Result<()> {
    file.sync_all()?;
    fs::rename(from, to)?;
    sync_parent_dir(to)
}

/// Fsync the directory containing `path`
pub(crate) fn sync_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        let dir = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}
