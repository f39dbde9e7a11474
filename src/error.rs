//! Error types for slatefs
//!
//! Defines a unified error type that can represent errors from all components.
//! Every variant maps onto one of the stable numeric codes sent to clients in
//! `ERROR` responses.

use std::fmt;
use std::io;

use crate::engine::types::SeqNo;

/// Unified error type for slatefs operations
#[derive(Debug, thiserror::Error)]
pub enum SlateError {
    /// I/O error (file operations, network)
    #[error("{0}")]
    Io(#[from] io::Error),
    /// Transaction ID does not refer to a known transaction
    #[error("TID ({0}) does not refer to a valid transaction.")]
    InvalidTransactionId(i64),
    /// Operation not permitted in the transaction's current state
    #[error("{0}")]
    InvalidOperation(String),
    /// A WRITE reused a sequence number already buffered for the transaction
    #[error("TID: {txn_id} has already used ({seq}) as a sequence number. Please provide a valid sequence number.")]
    DuplicateSequence { txn_id: u64, seq: SeqNo },
    /// A COMMIT named a different bound than the one fixed by the first COMMIT
    #[error("TID:{txn_id} has already been requested to commit with a different sequence number ({expected})")]
    SequenceMismatch { txn_id: u64, expected: SeqNo },
    /// Malformed request (header, framing, filename)
    #[error("{0}")]
    WrongMessageFormat(String),
    /// File could not be read or written
    #[error("{0}")]
    FileIo(String),
    /// Requested file does not exist
    #[error("{0}")]
    FileNotFound(String),
    /// Client stalled past the read timeout, or a wait expired
    #[error("{0}")]
    Timeout(String),
    /// WAL content could not be decoded
    #[error("WAL corruption: {0}")]
    WalCorruption(String),
    /// Inter-server channel failure
    #[error("replication: {0}")]
    Replication(String),
    /// Encoding/decoding failure
    #[error("codec: {0}")]
    Codec(String),
    /// Invalid configuration or coordination file
    #[error("configuration: {0}")]
    Config(String),
}

impl From<bincode::Error> for SlateError {
    fn from(e: bincode::Error) -> Self {
        SlateError::Codec(e.to_string())
    }
}

/// Result type alias for slatefs operations
pub type Result<T> = std::result::Result<T, SlateError>;

/// Stable error codes carried in `ERROR` responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    None,
    InvalidTransactionId,
    InvalidOperation,
    WrongMessageFormat,
    FileIoError,
    FileNotFound,
    Timeout,
}

impl ErrorCode {
    /// Numeric code as sent on the wire
    pub fn id(&self) -> u16 {
        match self {
            ErrorCode::None => 0,
            ErrorCode::InvalidTransactionId => 201,
            ErrorCode::InvalidOperation => 202,
            ErrorCode::WrongMessageFormat => 204,
            ErrorCode::FileIoError => 205,
            ErrorCode::FileNotFound => 206,
            ErrorCode::Timeout => 504,
        }
    }

    /// Human-readable reason, used as the prefix of error payloads
    pub fn reason(&self) -> &'static str {
        match self {
            ErrorCode::None => "None",
            ErrorCode::InvalidTransactionId => "Invalid transaction ID",
            ErrorCode::InvalidOperation => "Invalid operation",
            ErrorCode::WrongMessageFormat => "Wrong message format",
            ErrorCode::FileIoError => "File I/O error",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::Timeout => "Timeout",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

impl SlateError {
    /// Get the wire error code for this error
    pub fn error_code(&self) -> ErrorCode {
        match self {
            SlateError::InvalidTransactionId(_) => ErrorCode::InvalidTransactionId,
            SlateError::InvalidOperation(_)
            | SlateError::DuplicateSequence { .. }
            | SlateError::SequenceMismatch { .. } => ErrorCode::InvalidOperation,
            SlateError::WrongMessageFormat(_) => ErrorCode::WrongMessageFormat,
            SlateError::FileNotFound(_) => ErrorCode::FileNotFound,
            SlateError::Timeout(_) => ErrorCode::Timeout,
            SlateError::Io(e) if e.kind() == io::ErrorKind::TimedOut => ErrorCode::Timeout,
            SlateError::Io(e) if e.kind() == io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            _ => ErrorCode::FileIoError,
        }
    }
}
