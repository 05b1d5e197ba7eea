//! Directory replication server
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           SyncServer                              │
//! │                                                                   │
//! │  ┌─────────────┐  ChangeEvent  ┌─────────────┐   snapshot()       │
//! │  │ TreeWatcher │──────────────>│ Broadcaster │───────────┐        │
//! │  └─────────────┘               └─────────────┘           v        │
//! │                                              ┌──────────────────┐ │
//! │  ┌─────────────┐   register()                │  ClientRegistry  │ │
//! │  │ accept loop │────────────────────────────>│ RwLock<Vec<...>> │ │
//! │  └─────────────┘                             └──────────────────┘ │
//! │         │ spawn                                       │ try_send  │
//! │         v                                             v           │
//! │  ┌──────────────────┐   outbound queue   ┌──────────────────────┐ │
//! │  │ session (reader) │<──────────────────>│ writer (per session) │ │
//! │  └──────────────────┘                    └──────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Locking
//!
//! The registry lock is the only lock shared across tasks. It is held for
//! the duration of a list operation and never across a network send.
//!
//! # Modules
//!
//! - `registry` - Connected clients and their sessions
//! - `broadcast` - Fan-out of watcher events
//! - `transfer` - File framing and the per-session writer
//! - `session` - Handshake, initial sync and the session lifecycle

pub mod broadcast;
pub mod registry;
pub mod session;
pub mod transfer;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::error::{Result, SyncError};
use crate::watcher::TreeWatcher;

pub use broadcast::{Broadcaster, PublishStats};
pub use registry::{ClientRegistry, ClientSession, SessionId, SessionState};
pub use session::{handle_connection, initial_sync, read_handshake, InitialSyncStats, ServerContext};
pub use transfer::{send_file, Outbound, TransferOutcome};

/// Accepts clients and keeps them in sync with one root directory
pub struct SyncServer {
    ctx: Arc<ServerContext>,
    bind_addr: String,
}

impl SyncServer {
    /// Validate the configuration. Nothing touches the network yet.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let root = config.root.canonicalize().map_err(|e| {
            SyncError::config(format!(
                "cannot resolve sync root {}: {}",
                config.root.display(),
                e
            ))
        })?;
        let bind_addr = config.bind_addr();

        Ok(Self {
            ctx: Arc::new(session::ServerContext {
                root,
                registry: Arc::new(ClientRegistry::new(config.max_clients)),
                options: config.options,
            }),
            bind_addr,
        })
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|source| SyncError::Bind {
                addr: self.bind_addr.clone(),
                source,
            })
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.ctx.registry)
    }

    pub fn root(&self) -> &Path {
        &self.ctx.root
    }

    /// Watch the root and serve clients until the task is dropped.
    ///
    /// The watcher is running before the first client is accepted, so every
    /// change after a client's snapshot reaches that client.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let watcher = TreeWatcher::new(&self.ctx.root)?;
        let broadcaster = Broadcaster::new(watcher.root().to_path_buf(), self.registry());
        let _watch = WatchTask(tokio::spawn(watch_loop(watcher, broadcaster)));

        if let Ok(addr) = listener.local_addr() {
            tracing::info!(
                "Serving {} on {} (max {} clients)",
                self.ctx.root.display(),
                addr,
                self.ctx.registry.max_clients()
            );
        }

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) => tracing::error!("Failed to accept connection: {}", e),
            }
        }
    }

    /// Register the connection and start its session, or turn it away
    /// without a handshake when the server is full.
    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let (tx, rx) = mpsc::channel(self.ctx.options.queue_capacity);
        match self.ctx.registry.register(ClientSession::new(peer, tx)) {
            Ok(session) => {
                tracing::info!("Accepted connection from {} as {}", peer, session.id());
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
                }
                tokio::spawn(handle_connection(stream, session, rx, Arc::clone(&self.ctx)));
            }
            Err(e) => {
                tracing::warn!("Rejecting connection from {}: {}", peer, e);
                drop(stream);
            }
        }
    }
}

/// Aborts the watcher loop when the server stops serving
struct WatchTask(JoinHandle<()>);

impl Drop for WatchTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn watch_loop(mut watcher: TreeWatcher, broadcaster: Broadcaster) {
    while let Some(event) = watcher.next_event().await {
        broadcaster.publish(&event);
    }
    tracing::warn!("[WATCHER] Event stream ended; no further changes will be replicated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerOptions;
    use tempfile::TempDir;

    fn local(root: &Path, max_clients: usize) -> ServerConfig {
        ServerConfig::new(root, 0, max_clients).with_options(ServerOptions {
            host: "127.0.0.1".to_string(),
            ..ServerOptions::default()
        })
    }

    #[test]
    fn test_new_rejects_missing_root() {
        let dir = TempDir::new().unwrap();
        let result = SyncServer::new(local(&dir.path().join("missing"), 1));
        assert!(matches!(result, Err(SyncError::Config { .. })));
    }

    #[test]
    fn test_new_rejects_zero_clients() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            SyncServer::new(local(dir.path(), 0)),
            Err(SyncError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let dir = TempDir::new().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let config = ServerConfig::new(dir.path(), port, 1).with_options(ServerOptions {
            host: "127.0.0.1".to_string(),
            ..ServerOptions::default()
        });
        let server = SyncServer::new(config).unwrap();
        assert!(matches!(server.bind().await, Err(SyncError::Bind { .. })));
    }

    #[test]
    fn test_root_is_canonical() {
        let dir = TempDir::new().unwrap();
        let server = SyncServer::new(local(dir.path(), 2)).unwrap();
        assert_eq!(server.root(), dir.path().canonicalize().unwrap());
        assert_eq!(server.registry().max_clients(), 2);
    }
}
