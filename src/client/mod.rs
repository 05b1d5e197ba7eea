//! Mirroring client
//!
//! Connects to a server, sends its ignore list, then applies every message
//! it receives to a local root until the server closes the connection.

pub mod applier;

use std::path::Path;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::config::ClientConfig;
use crate::error::{Result, SyncError};
use crate::protocol::FrameReader;

pub use applier::{Applied, Applier, ApplyStats};

pub struct SyncClient {
    config: ClientConfig,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Connect and mirror until the server hangs up
    pub async fn run(&self) -> Result<ApplyStats> {
        std::fs::create_dir_all(&self.config.root).map_err(|e| {
            SyncError::config(format!(
                "cannot create mirror root {}: {}",
                self.config.root.display(),
                e
            ))
        })?;

        let addr = self.config.server_addr();
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| SyncError::Connect {
                addr: addr.clone(),
                source,
            })?;
        tracing::info!(
            "Connected to {}, mirroring into {}",
            addr,
            self.config.root.display()
        );
        self.sync_over(stream).await
    }

    /// Handshake and apply loop over an established stream
    pub async fn sync_over<S>(&self, stream: S) -> Result<ApplyStats>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);

        let handshake = format!("{}\n", self.config.ignore.to_line());
        write_half.write_all(handshake.as_bytes()).await?;
        write_half.flush().await?;
        tracing::debug!("Sent ignore list: {:?}", self.config.ignore.patterns());

        let mut reader = FrameReader::new(BufReader::new(read_half), self.config.options.max_line_len);
        let mut applier = Applier::new(&self.config.root);

        loop {
            let msg = match reader.next_message().await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(SyncError::Protocol(e)) => {
                    tracing::warn!("Ignoring bad message: {}", e);
                    continue;
                }
                Err(e) => {
                    applier.abandon().await;
                    return Err(e);
                }
            };

            let command = msg.command();
            match applier.apply(msg).await {
                Ok(applied) => tracing::debug!("{} -> {:?}", command, applied),
                Err(e) => tracing::warn!("Failed to apply {}: {}", command, e),
            }
        }

        let stats = applier.stats();
        tracing::info!(
            "Server closed the connection ({} files, {} bytes, {} dirs, {} removed)",
            stats.files_written,
            stats.bytes_written,
            stats.dirs_created,
            stats.removed
        );
        Ok(stats)
    }
}
