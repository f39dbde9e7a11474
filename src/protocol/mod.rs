//! Client protocol handler for slatefs
//!
//! ## Protocol Overview
//!
//! Clients speak a line-oriented text protocol:
//! 1. **NEW_TXN** opens a transaction on a file and returns its ID
//! 2. **WRITE** buffers data under a sequence number (no response)
//! 3. **COMMIT** names the last sequence number; missing writes are
//!    requested with one `ASK_RESEND` per gap, otherwise the commit is
//!    applied, replicated and acknowledged
//! 4. **ABORT** discards the transaction
//! 5. **READ** returns the current content of a file
//!
//! ## Connection Routing
//!
//! Client requests and replication frames share one port. The first byte of
//! a connection decides: `0xA7` starts a peer session, anything else a
//! client session.
//!
//! ## Error Handling
//!
//! Malformed requests and mid-request timeouts are answered with `ERROR`
//! and the connection is closed, since the stream position is lost.
//! Transaction and file errors are answered with `ERROR` and the
//! connection stays open.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::engine::{CommitOutcome, TxnId, WriteOutcome};
use crate::error::{ErrorCode, Result, SlateError};
use crate::replication::{serve_primary, serve_sync, FRAME_MAGIC};
use crate::{blocking, ServerContext};

pub mod request;
pub mod response;

pub use request::{read_request, Method, Request, MAX_CONTENT_LENGTH};
pub use response::{Response, ResponseMethod};

/// Route a fresh connection to a client or peer session
pub async fn handle_connection<S>(stream: S, peer: SocketAddr, ctx: Arc<ServerContext>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = BufReader::new(stream);
    let first = match tokio::time::timeout(ctx.config.read_timeout, conn.fill_buf()).await {
        Err(_) => {
            log::debug!("Connection from {} idle, closing", peer);
            return Ok(());
        }
        Ok(buf) => buf?.first().copied(),
    };

    match first {
        None => Ok(()),
        Some(FRAME_MAGIC) => serve_peer(conn, peer, ctx).await,
        Some(_) => ConnectionHandler::new(conn, peer, ctx).run().await,
    }
}

async fn serve_peer<S>(mut conn: BufReader<S>, peer: SocketAddr, ctx: Arc<ServerContext>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if ctx.cluster.is_primary() {
        let allowed = ctx.backup.as_ref().map(|link| link.backup_addr());
        return serve_sync(&mut conn, peer, &ctx.coordinator, allowed).await;
    }

    let record = ctx.cluster.coordination().read()?;
    match record {
        Some(record) if record.is_replication_source(peer) => {
            log::debug!("Replication session from primary {}", peer);
            serve_primary(&mut conn, Arc::clone(&ctx.coordinator)).await
        }
        _ => {
            log::warn!("Rejecting replication traffic from {}", peer);
            Ok(())
        }
    }
}

/// Handles a single client connection
pub struct ConnectionHandler<S> {
    conn: BufReader<S>,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(conn: BufReader<S>, peer: SocketAddr, ctx: Arc<ServerContext>) -> Self {
        Self { conn, peer, ctx }
    }

    /// Serve requests until the client disconnects, idles out or breaks framing
    pub async fn run(mut self) -> Result<()> {
        let read_timeout = self.ctx.config.read_timeout;
        loop {
            // Idle between requests: close quietly
            match tokio::time::timeout(read_timeout, self.conn.fill_buf()).await {
                Err(_) => {
                    log::debug!("Client {} idle, closing", self.peer);
                    return Ok(());
                }
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(buf)) if buf.is_empty() => return Ok(()),
                Ok(Ok(_)) => {}
            }

            let request = match tokio::time::timeout(read_timeout, read_request(&mut self.conn)).await {
                Err(_) => {
                    let response = Response::error(
                        -1,
                        ErrorCode::Timeout,
                        "Timed out waiting for the rest of the request",
                    );
                    self.send(&[response]).await?;
                    return Ok(());
                }
                Ok(Ok(Some(request))) => request,
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(SlateError::Io(e))) => {
                    log::debug!("Client {} dropped mid-request: {}", self.peer, e);
                    return Ok(());
                }
                Ok(Err(e)) => {
                    log::debug!("Malformed request from {}: {}", self.peer, e);
                    self.send(&[Response::from_error(-1, &e)]).await?;
                    return Ok(());
                }
            };

            log::debug!(
                "{} {} {} from {}",
                request.method,
                request.txn_id,
                request.seq,
                self.peer
            );

            let responses = if self.ctx.cluster.is_primary() {
                let txn_id = request.txn_id;
                match self.dispatch(request).await {
                    Ok(responses) => responses,
                    Err(e) => vec![Response::from_error(txn_id, &e)],
                }
            } else {
                let primary = self.ctx.cluster.primary_addr();
                vec![Response::error(
                    -1,
                    ErrorCode::InvalidOperation,
                    &format!(
                        "Request ignored, forward your request to the current primary server ({}:{})",
                        primary.ip(),
                        primary.port()
                    ),
                )]
            };
            self.send(&responses).await?;
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Vec<Response>> {
        let coordinator = Arc::clone(&self.ctx.coordinator);
        match request.method {
            Method::NewTxn => {
                let filename = request.filename()?.to_string();
                let txn_id = blocking(move || coordinator.new_transaction(&filename)).await?;
                Ok(vec![Response::ack(txn_id as i64, request.seq)])
            }
            Method::Read => {
                let filename = request.filename()?.to_string();
                let data = blocking(move || coordinator.read_file(&filename)).await?;
                Ok(vec![Response::content(data)])
            }
            Method::Write => {
                let txn_id = to_txn_id(request.txn_id)?;
                let seq = request.seq as u64;
                let data = request.content;
                match blocking(move || coordinator.write(txn_id, seq, data)).await? {
                    WriteOutcome::Buffered => Ok(Vec::new()),
                    WriteOutcome::Committed { .. } => {
                        self.replicate(txn_id).await;
                        Ok(vec![Response::ack(request.txn_id, -1)])
                    }
                }
            }
            Method::Commit => {
                let txn_id = to_txn_id(request.txn_id)?;
                let seq = request.seq as u64;
                match blocking(move || coordinator.request_commit(txn_id, seq)).await? {
                    CommitOutcome::Missing(missing) => Ok(missing
                        .into_iter()
                        .map(|seq| Response::ask_resend(request.txn_id, seq as i64))
                        .collect()),
                    CommitOutcome::Committed { .. } => {
                        self.replicate(txn_id).await;
                        Ok(vec![Response::ack(request.txn_id, -1)])
                    }
                }
            }
            Method::Abort => {
                let txn_id = to_txn_id(request.txn_id)?;
                blocking(move || coordinator.abort(txn_id)).await?;
                Ok(vec![Response::ack(request.txn_id, -1)])
            }
        }
    }

    /// Best-effort push to the backup; the client is acknowledged either way
    async fn replicate(&self, txn_id: TxnId) {
        let link = match &self.ctx.backup {
            Some(link) => link,
            None => return,
        };
        match self.ctx.coordinator.snapshot(txn_id) {
            Ok(rec) if rec.received_backup_ack() => {}
            Ok(_) => {
                link.replicate(txn_id).await;
            }
            Err(e) => log::warn!("Cannot replicate transaction {}: {}", txn_id, e),
        }
    }

    async fn send(&mut self, responses: &[Response]) -> Result<()> {
        if responses.is_empty() {
            return Ok(());
        }
        let mut out = Vec::new();
        for response in responses {
            out.extend_from_slice(&response.encode());
        }
        let stream = self.conn.get_mut();
        stream.write_all(&out).await?;
        stream.flush().await?;
        Ok(())
    }
}

fn to_txn_id(raw: i64) -> Result<TxnId> {
    if raw <= 0 {
        return Err(SlateError::InvalidTransactionId(raw));
    }
    Ok(raw as TxnId)
}
