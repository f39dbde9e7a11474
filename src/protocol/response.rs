//! Response encoding
//!
//! ```text
//! <ACK|ASK_RESEND|ERROR> <transaction-id> <sequence> <error-code> <content-length>
//! ```
//!
//! followed by `\r\n\r\n\r\n` when there is no content, or `\r\n\r\n` and
//! the content. `-1` marks a numeric field that does not apply.

use std::fmt;

use crate::error::{ErrorCode, SlateError};

/// Response methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMethod {
    Ack,
    AskResend,
    Error,
}

impl fmt::Display for ResponseMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseMethod::Ack => write!(f, "ACK"),
            ResponseMethod::AskResend => write!(f, "ASK_RESEND"),
            ResponseMethod::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub method: ResponseMethod,
    pub txn_id: i64,
    pub seq: i64,
    pub error: ErrorCode,
    pub content: Option<Vec<u8>>,
}

impl Response {
    pub fn ack(txn_id: i64, seq: i64) -> Self {
        Self {
            method: ResponseMethod::Ack,
            txn_id,
            seq,
            error: ErrorCode::None,
            content: None,
        }
    }

    /// ACK carrying file content (READ)
    pub fn content(data: Vec<u8>) -> Self {
        Self {
            method: ResponseMethod::Ack,
            txn_id: -1,
            seq: -1,
            error: ErrorCode::None,
            content: Some(data),
        }
    }

    pub fn ask_resend(txn_id: i64, missing: i64) -> Self {
        Self {
            method: ResponseMethod::AskResend,
            txn_id,
            seq: missing,
            error: ErrorCode::None,
            content: None,
        }
    }

    pub fn error(txn_id: i64, code: ErrorCode, message: &str) -> Self {
        Self {
            method: ResponseMethod::Error,
            txn_id,
            seq: -1,
            error: code,
            content: Some(format!("{}: {}", code.reason(), message).into_bytes()),
        }
    }

    pub fn from_error(txn_id: i64, err: &SlateError) -> Self {
        Self::error(txn_id, err.error_code(), &err.to_string())
    }

    pub fn encode(&self) -> Vec<u8> {
        let len = self.content.as_ref().map_or(0, |c| c.len());
        let mut out = format!(
            "{} {} {} {} {}",
            self.method,
            self.txn_id,
            self.seq,
            self.error.id(),
            len
        )
        .into_bytes();
        match &self.content {
            Some(content) => {
                out.extend_from_slice(b"\r\n\r\n");
                out.extend_from_slice(content);
            }
            None => out.extend_from_slice(b"\r\n\r\n\r\n"),
        }
        out
    }
}
