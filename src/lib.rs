//! dirsync: directory replication over a line protocol
//!
//! A server watches one directory tree and pushes every structural change,
//! plus file contents, to any number of connected clients. Each client
//! chooses at connect time which paths it does not want (substring
//! patterns) and mirrors the rest into its own root.
//!
//! # Example
//!
//! ```ignore
//! use dirsync::config::{ServerConfig, ClientConfig, ClientOptions};
//! use dirsync::{IgnoreSpec, SyncClient, SyncServer};
//!
//! let server = SyncServer::new(ServerConfig::new("/srv/shared", 8080, 16))?;
//! let listener = server.bind().await?;
//! tokio::spawn(async move { server.serve(listener).await });
//!
//! let client = SyncClient::new(ClientConfig::new(
//!     "./mirror",
//!     IgnoreSpec::parse("log,tmp"),
//!     ClientOptions::default(),
//! ));
//! client.run().await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod filter;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod tree;
pub mod watcher;

// Re-export commonly used types
pub use client::{Applier, ApplyStats, SyncClient};
pub use config::{ClientConfig, ServerConfig, SyncConfig};
pub use error::{Result, SyncError};
pub use filter::IgnoreSpec;
pub use protocol::{FrameReader, ProtocolError, WireMessage};
pub use server::{Broadcaster, ClientRegistry, ClientSession, SyncServer};
pub use watcher::{ChangeEvent, ChangeKind, TreeWatcher};
