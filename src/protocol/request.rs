//! Client request parsing
//!
//! ```text
//! <METHOD> <transaction-id> <sequence> <content-length>\r\n
//! \r\n<content>            NEW_TXN, READ, WRITE
//! \r\n\r\n                 COMMIT, ABORT
//! ```

use std::fmt;
use std::str::FromStr;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{Result, SlateError};
use crate::storage::validate_filename;

/// Largest accepted content length in bytes
pub const MAX_CONTENT_LENGTH: i64 = 2048;

/// Longest header line we are willing to buffer
const MAX_HEADER_LEN: u64 = 256;

const CRLF: &[u8] = b"\r\n";

/// Request methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    NewTxn,
    Read,
    Write,
    Commit,
    Abort,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::NewTxn => "NEW_TXN",
            Method::Read => "READ",
            Method::Write => "WRITE",
            Method::Commit => "COMMIT",
            Method::Abort => "ABORT",
        }
    }

    /// Methods followed by content rather than a second blank line
    pub fn has_content(&self) -> bool {
        matches!(self, Method::NewTxn | Method::Read | Method::Write)
    }
}

impl FromStr for Method {
    type Err = SlateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NEW_TXN" => Ok(Method::NewTxn),
            "READ" => Ok(Method::Read),
            "WRITE" => Ok(Method::Write),
            "COMMIT" => Ok(Method::Commit),
            "ABORT" => Ok(Method::Abort),
            _ => Err(SlateError::WrongMessageFormat(format!(
                "Unknown method {}",
                s
            ))),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// `-1` for NEW_TXN, which does not carry one
    pub txn_id: i64,
    pub seq: i64,
    pub content: Vec<u8>,
}

impl Request {
    /// Content interpreted as a filename (NEW_TXN, READ)
    pub fn filename(&self) -> Result<&str> {
        let name = std::str::from_utf8(&self.content)
            .map_err(|_| SlateError::WrongMessageFormat("File name is not valid UTF-8".into()))?;
        validate_filename(name)?;
        Ok(name)
    }
}

/// Read one request. Returns `None` on a clean end of stream before any byte
/// of a new request.
///
/// Any error leaves the stream at an unknown position; the caller must not
/// read further requests from it.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(MAX_HEADER_LEN)
        .read_until(b'\n', &mut line)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if !line.ends_with(CRLF) {
        return Err(SlateError::WrongMessageFormat(
            "Request header must end with CRLF".to_string(),
        ));
    }
    line.truncate(line.len() - CRLF.len());

    let header = std::str::from_utf8(&line)
        .map_err(|_| SlateError::WrongMessageFormat("Request header is not text".to_string()))?;
    let fields: Vec<&str> = header.split(' ').collect();
    if fields.len() != 4 {
        return Err(SlateError::WrongMessageFormat(format!(
            "Number of field(s) provided ({}), required (4)",
            fields.len()
        )));
    }

    let method: Method = fields[0].parse()?;
    let seq = parse_int(fields[2], "sequence number")?;
    let content_length = parse_int(fields[3], "content length")?;

    if content_length < 0 {
        return Err(SlateError::WrongMessageFormat(
            "Content length cannot be negative".to_string(),
        ));
    }
    if content_length > MAX_CONTENT_LENGTH {
        return Err(SlateError::InvalidOperation(format!(
            "Content length is too large. The maximum size accepted is {} bytes",
            MAX_CONTENT_LENGTH
        )));
    }

    let txn_id = match method {
        Method::NewTxn => {
            if seq != 0 {
                return Err(SlateError::WrongMessageFormat(
                    "Sequence number must be zero (0) for NEW_TXN".to_string(),
                ));
            }
            if content_length == 0 {
                return Err(SlateError::WrongMessageFormat(
                    "Content length must be the length of the filename in bytes for NEW_TXN"
                        .to_string(),
                ));
            }
            -1
        }
        Method::Read => {
            if content_length == 0 {
                return Err(SlateError::WrongMessageFormat(
                    "Content length must be the length of the filename in bytes for READ"
                        .to_string(),
                ));
            }
            parse_int(fields[1], "transaction ID")?
        }
        Method::Write | Method::Commit => {
            if seq <= 0 {
                return Err(SlateError::WrongMessageFormat(format!(
                    "Sequence number must be > 0 for {}",
                    method
                )));
            }
            parse_int(fields[1], "transaction ID")?
        }
        Method::Abort => parse_int(fields[1], "transaction ID")?,
    };

    let content = if method.has_content() {
        expect_bytes(reader, CRLF, "this method expects another CRLF after the header").await?;
        let mut content = vec![0u8; content_length as usize];
        reader.read_exact(&mut content).await?;
        content
    } else {
        expect_bytes(
            reader,
            b"\r\n\r\n",
            "Two CRLFs must follow the request header if there is no data",
        )
        .await?;
        Vec::new()
    };

    Ok(Some(Request {
        method,
        txn_id,
        seq,
        content,
    }))
}

fn parse_int(field: &str, what: &str) -> Result<i64> {
    field
        .parse::<i32>()
        .map(i64::from)
        .map_err(|_| SlateError::WrongMessageFormat(format!("Could not parse {}: {}", what, field)))
}

async fn expect_bytes<R>(reader: &mut R, expected: &[u8], message: &str) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = vec![0u8; expected.len()];
    reader.read_exact(&mut buf).await?;
    if buf != expected {
        return Err(SlateError::WrongMessageFormat(message.to_string()));
    }
    Ok(())
}
