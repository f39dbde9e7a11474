//! Shared helpers for the networked integration tests
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use slatefs::engine::CommitCoordinator;
use slatefs::replication::ClusterState;
use slatefs::{Config, Server};

/// A running server plus handles into it
pub struct Running {
    pub addr: SocketAddr,
    pub coordinator: Arc<CommitCoordinator>,
    pub cluster: Arc<ClusterState>,
    pub task: JoinHandle<()>,
}

impl Running {
    pub fn stop(self) -> Arc<CommitCoordinator> {
        self.task.abort();
        self.coordinator
    }
}

/// Config bound to an ephemeral port, data under `root/name`
pub fn config(root: &Path, name: &str) -> Config {
    Config {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        data_dir: root.join(name),
        coordination_file: root.join("primary.txt"),
        replication_timeout: Duration::from_secs(5),
        sync_timeout: Duration::from_secs(2),
        probe_interval: Duration::from_millis(100),
        probe_timeout: Duration::from_millis(200),
        ..Config::default()
    }
}

/// Reserve a free port for a server that starts later
pub fn reserve_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("failed to bind to port 0");
    listener.local_addr().expect("failed to get local addr")
}

pub async fn start(config: Config) -> Running {
    let server = Server::new(config).await.expect("failed to create server");
    let addr = server.local_addr();
    let coordinator = server.coordinator();
    let cluster = server.cluster();
    let task = tokio::spawn(async move {
        let _ = server.run().await;
    });
    Running {
        addr,
        coordinator,
        cluster,
        task,
    }
}

/// One decoded response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub method: String,
    pub txn_id: i64,
    pub seq: i64,
    pub code: u16,
    pub content: Vec<u8>,
}

impl Reply {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}

pub struct Client {
    stream: BufReader<TcpStream>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            stream: BufReader::new(stream),
        }
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.get_mut().write_all(bytes).await.expect("send");
    }

    pub async fn send(&mut self, method: &str, txn_id: i64, seq: i64, content: &[u8]) {
        let mut msg = format!("{} {} {} {}\r\n", method, txn_id, seq, content.len()).into_bytes();
        if content.is_empty() && matches!(method, "COMMIT" | "ABORT") {
            msg.extend_from_slice(b"\r\n\r\n");
        } else {
            msg.extend_from_slice(b"\r\n");
            msg.extend_from_slice(content);
        }
        self.send_raw(&msg).await;
    }

    pub async fn recv(&mut self) -> Reply {
        tokio::time::timeout(Duration::from_secs(10), self.read_reply())
            .await
            .expect("timed out waiting for a response")
            .expect("connection closed before a response")
    }

    /// True once the server has closed the connection
    pub async fn is_closed(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(
            tokio::time::timeout(Duration::from_secs(10), self.stream.read(&mut byte)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }

    async fn read_reply(&mut self) -> Option<Reply> {
        let mut line = String::new();
        if self.stream.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let fields: Vec<&str> = line.trim_end().split(' ').collect();
        assert_eq!(fields.len(), 5, "bad response header {:?}", line);
        let len: usize = fields[4].parse().unwrap();

        let mut crlf = [0u8; 2];
        self.stream.read_exact(&mut crlf).await.ok()?;
        assert_eq!(&crlf, b"\r\n");
        let mut content = vec![0u8; len];
        if len == 0 {
            self.stream.read_exact(&mut crlf).await.ok()?;
            assert_eq!(&crlf, b"\r\n");
        } else {
            self.stream.read_exact(&mut content).await.ok()?;
        }

        Some(Reply {
            method: fields[0].to_string(),
            txn_id: fields[1].parse().unwrap(),
            seq: fields[2].parse().unwrap(),
            code: fields[3].parse().unwrap(),
            content,
        })
    }

    pub async fn new_txn(&mut self, filename: &str) -> i64 {
        self.send("NEW_TXN", -1, 0, filename.as_bytes()).await;
        let reply = self.recv().await;
        assert_eq!(reply.method, "ACK", "NEW_TXN failed: {}", reply.text());
        reply.txn_id
    }

    pub async fn read(&mut self, filename: &str) -> Reply {
        self.send("READ", -1, 0, filename.as_bytes()).await;
        self.recv().await
    }

    /// NEW_TXN, one WRITE per chunk, COMMIT; returns the COMMIT reply
    pub async fn commit_file(&mut self, filename: &str, chunks: &[&str]) -> Reply {
        let txn_id = self.new_txn(filename).await;
        for (i, chunk) in chunks.iter().enumerate() {
            self.send("WRITE", txn_id, i as i64 + 1, chunk.as_bytes()).await;
        }
        self.send("COMMIT", txn_id, chunks.len() as i64, b"").await;
        self.recv().await
    }
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
