//! Per-file reader/writer admission
//!
//! Every file the server knows about has a counter: `0` is free, a positive
//! value counts active readers and `-1` marks an exclusive writer. Callers
//! block on a condition variable until admission is possible and get back an
//! RAII guard that releases the slot on drop.
//!
//! There is no fairness: a steady stream of readers can starve a writer.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

const WRITER: i64 = -1;

/// Reader/writer table keyed by filename
#[derive(Debug, Default)]
pub struct FileAccessTable {
    counts: Mutex<HashMap<String, i64>>,
    changed: Condvar,
}

/// Shared access to one file, released on drop
#[derive(Debug)]
pub struct ReadGuard<'a> {
    table: &'a FileAccessTable,
    filename: String,
}

/// Exclusive access to one file, released on drop
#[derive(Debug)]
pub struct WriteGuard<'a> {
    table: &'a FileAccessTable,
    filename: String,
}

impl FileAccessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table with `filenames` already registered
    pub fn with_files<I, S>(filenames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let counts = filenames.into_iter().map(|f| (f.into(), 0)).collect();
        Self {
            counts: Mutex::new(counts),
            changed: Condvar::new(),
        }
    }

    /// Register a file if it is not known yet
    pub fn register(&self, filename: &str) {
        let mut counts = self.counts.lock().expect("file access table lock poisoned");
        counts.entry(filename.to_string()).or_insert(0);
    }

    /// Current counter for a file (`None` if unregistered)
    pub fn state(&self, filename: &str) -> Option<i64> {
        let counts = self.counts.lock().expect("file access table lock poisoned");
        counts.get(filename).copied()
    }

    /// Block until no writer holds the file, then join as a reader.
    /// Unregistered files are registered on first use.
    pub fn acquire_read(&self, filename: &str) -> ReadGuard<'_> {
        let mut counts = self.counts.lock().expect("file access table lock poisoned");
        loop {
            let count = counts.entry(filename.to_string()).or_insert(0);
            if *count >= 0 {
                *count += 1;
                break;
            }
            counts = self
                .changed
                .wait(counts)
                .expect("file access table lock poisoned");
        }
        ReadGuard {
            table: self,
            filename: filename.to_string(),
        }
    }

    /// Block until the file is free, then take it exclusively.
    /// Unregistered files are registered on first use.
    pub fn acquire_write(&self, filename: &str) -> WriteGuard<'_> {
        let mut counts = self.counts.lock().expect("file access table lock poisoned");
        loop {
            let count = counts.entry(filename.to_string()).or_insert(0);
            if *count == 0 {
                *count = WRITER;
                break;
            }
            counts = self
                .changed
                .wait(counts)
                .expect("file access table lock poisoned");
        }
        WriteGuard {
            table: self,
            filename: filename.to_string(),
        }
    }

    fn release_read(&self, filename: &str) {
        let mut counts = self.counts.lock().expect("file access table lock poisoned");
        if let Some(count) = counts.get_mut(filename) {
            if *count > 0 {
                *count -= 1;
            }
        }
        self.changed.notify_all();
    }

    fn release_write(&self, filename: &str) {
        let mut counts = self.counts.lock().expect("file access table lock poisoned");
        if let Some(count) = counts.get_mut(filename) {
            if *count == WRITER {
                *count = 0;
            }
        }
        self.changed.notify_all();
    }
}

impl ReadGuard<'_> {
    pub fn filename(&self) -> &str {
        &self.filename
    }
}

impl WriteGuard<'_> {
    pub fn filename(&self) -> &str {
        &self.filename
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.table.release_read(&self.filename);
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.table.release_write(&self.filename);
    }
}
