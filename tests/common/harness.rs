//! Loopback server and raw protocol client for integration tests

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use dirsync::config::{ServerConfig, ServerOptions};
use dirsync::protocol::DEFAULT_MAX_LINE_LEN;
use dirsync::{ClientRegistry, FrameReader, SyncServer, WireMessage};

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(10);

/// A server serving on an ephemeral loopback port; stops when dropped
pub struct RunningServer {
    pub addr: SocketAddr,
    pub registry: Arc<ClientRegistry>,
    task: JoinHandle<dirsync::Result<()>>,
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn start_server(root: &Path, max_clients: usize) -> RunningServer {
    start_server_with(root, max_clients, ServerOptions::default()).await
}

pub async fn start_server_with(
    root: &Path,
    max_clients: usize,
    options: ServerOptions,
) -> RunningServer {
    let options = ServerOptions {
        host: "127.0.0.1".to_string(),
        ..options
    };
    let server = SyncServer::new(ServerConfig::new(root, 0, max_clients).with_options(options))
        .expect("Failed to configure server");
    let listener = server.bind().await.expect("Failed to bind");
    let addr = listener.local_addr().expect("No local addr");
    let registry = server.registry();
    let task = tokio::spawn(async move { server.serve(listener).await });

    RunningServer {
        addr,
        registry,
        task,
    }
}

/// Speaks the wire protocol directly so tests can assert on exact messages
pub struct RawClient {
    reader: FrameReader<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl RawClient {
    /// Connect and send `ignore` as the handshake line
    pub async fn connect(addr: SocketAddr, ignore: &str) -> Self {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        let (read_half, mut writer) = stream.into_split();
        writer
            .write_all(format!("{}\n", ignore).as_bytes())
            .await
            .expect("Failed to send handshake");
        Self {
            reader: FrameReader::new(BufReader::new(read_half), DEFAULT_MAX_LINE_LEN),
            writer,
        }
    }

    /// Next message; panics on timeout, EOF, or a decode error
    pub async fn next(&mut self) -> WireMessage {
        tokio::time::timeout(WAIT, self.reader.next_message())
            .await
            .expect("Timed out waiting for a message")
            .expect("Failed to decode message")
            .expect("Server closed the connection")
    }

    /// Next message if one arrives within `within`
    pub async fn try_next(&mut self, within: Duration) -> Option<WireMessage> {
        match tokio::time::timeout(within, self.reader.next_message()).await {
            Ok(Ok(msg)) => msg,
            _ => None,
        }
    }

    /// Hang up both directions
    pub fn close(self) {
        drop(self.writer);
        drop(self.reader);
    }

    /// Read until `done` matches, returning everything seen including the match
    pub async fn collect_until(&mut self, done: impl Fn(&WireMessage) -> bool) -> Vec<WireMessage> {
        let mut seen = Vec::new();
        loop {
            let msg = self.next().await;
            let finished = done(&msg);
            seen.push(msg);
            if finished {
                return seen;
            }
        }
    }
}

/// Poll `check` until it holds or `WAIT` elapses
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
