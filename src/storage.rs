//! File storage for slatefs
//!
//! ## Directory Layout
//!
//! ```text
//! data/
//! ├── .slatelog                          # Write-ahead log
//! ├── .slatelog.recovery                 # Log being rebuilt during recovery
//! ├── .slate-staging.<tid>.<filename>    # Commit in progress for <filename>
//! ├── report.txt                         # Client files
//! └── ...
//! ```
//!
//! Client files never start with `.`, so every internal file is hidden from
//! listings and cannot be addressed by a request.
//!
//! ### Commit Materialization
//! A commit never modifies a live file in place:
//! 1. `stage` copies the live file to the transaction's staging file, appends
//!    the committed payload and syncs it
//! 2. `publish` renames the staging file over the live file and syncs the
//!    directory
//!
//! A crash between the two steps leaves the live file untouched and the
//! staging file complete, so recovery can finish the rename.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::engine::types::TxnId;
use crate::engine::wal::sync_parent_dir;
use crate::error::{Result, SlateError};

/// Name of the write-ahead log inside the data directory
pub const LOG_FILE: &str = ".slatelog";
/// Name of the log written while recovery replays `LOG_FILE`
pub const RECOVERY_LOG_FILE: &str = ".slatelog.recovery";

const STAGING_PREFIX: &str = ".slate-staging.";

/// Longest accepted client filename in bytes
pub const MAX_FILENAME_LEN: usize = 254;

/// Client filenames: `[A-Za-z0-9._-]+`, at most 254 bytes, not hidden
pub fn validate_filename(filename: &str) -> Result<()> {
    if filename.is_empty() {
        return Err(SlateError::WrongMessageFormat("File name is empty".to_string()));
    }
    if filename.len() > MAX_FILENAME_LEN {
        return Err(SlateError::WrongMessageFormat(format!(
            "File name is longer than {} bytes",
            MAX_FILENAME_LEN
        )));
    }
    if filename.starts_with('.') {
        return Err(SlateError::WrongMessageFormat(format!(
            "File name {} must not start with '.'",
            filename
        )));
    }
    if !filename
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
    {
        return Err(SlateError::WrongMessageFormat(format!(
            "File name {} may only contain letters, digits, '.', '_' and '-'",
            filename
        )));
    }
    Ok(())
}

/// A staging file found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingFile {
    pub txn_id: TxnId,
    pub filename: String,
    pub path: PathBuf,
}

/// Data directory holding the client files and internal files
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open the data directory, creating it if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    pub fn recovery_log_path(&self) -> PathBuf {
        self.dir.join(RECOVERY_LOG_FILE)
    }

    pub fn live_path(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    pub fn staging_path(&self, txn_id: TxnId, filename: &str) -> PathBuf {
        self.dir.join(format!("{}{}.{}", STAGING_PREFIX, txn_id, filename))
    }

    /// Client files currently in the directory (hidden files skipped)
    pub fn list_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    files.push(name.to_string());
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// Staging files left by interrupted commits
    pub fn staging_files(&self) -> Result<Vec<StagingFile>> {
        let mut staged = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            let rest = match name.strip_prefix(STAGING_PREFIX) {
                Some(rest) => rest,
                None => continue,
            };
            let parsed = rest
                .split_once('.')
                .and_then(|(tid, filename)| tid.parse::<TxnId>().ok().map(|t| (t, filename)));
            match parsed {
                Some((txn_id, filename)) if !filename.is_empty() => staged.push(StagingFile {
                    txn_id,
                    filename: filename.to_string(),
                    path: entry.path(),
                }),
                _ => log::warn!("Ignoring unrecognised staging file {}", name),
            }
        }
        Ok(staged)
    }

    pub fn has_staging(&self, txn_id: TxnId, filename: &str) -> bool {
        self.staging_path(txn_id, filename).is_file()
    }

    /// Write the live content plus `payload` to the staging file and sync it
    pub fn stage(&self, txn_id: TxnId, filename: &str, payload: &[u8]) -> Result<PathBuf> {
        let live = self.live_path(filename);
        let staging = self.staging_path(txn_id, filename);

        match fs::copy(&live, &staging) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                File::create(&staging)?;
            }
            Err(e) => return Err(e.into()),
        }

        let mut file = OpenOptions::new().append(true).open(&staging)?;
        file.write_all(payload)?;
        file.sync_all()?;
        Ok(staging)
    }

    /// Atomically replace the live file with the transaction's staging file
    pub fn publish(&self, txn_id: TxnId, filename: &str) -> Result<()> {
        let staging = self.staging_path(txn_id, filename);
        let live = self.live_path(filename);
        fs::rename(&staging, &live)?;
        sync_parent_dir(&live)
    }

    pub fn remove(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Full content of a client file
    pub fn read(&self, filename: &str) -> Result<Vec<u8>> {
        match fs::read(self.live_path(filename)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(SlateError::FileNotFound(
                format!("{} does not exist", filename),
            )),
            Err(e) => Err(SlateError::FileIo(format!("cannot read {}: {}", filename, e))),
        }
    }
}
