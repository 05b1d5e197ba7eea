//! Error types and exit codes for dirsync

use std::path::PathBuf;
use std::process::ExitCode;
use thiserror::Error;

use crate::protocol::ProtocolError;

/// Main error type for dirsync operations
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("Client capacity exceeded ({max} clients)")]
    CapacityExceeded { max: usize },

    #[error("Failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        source: notify::Error,
    },

    #[error("Session {id} is closed")]
    SessionClosed { id: String },

    #[error("Outbound queue full for session {id}")]
    QueueOverflow { id: String },

    #[error("Refusing unsafe path: {path}")]
    UnsafePath { path: String },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Convert error to a process exit code:
    /// - 0: Success
    /// - 1: Argument, configuration, bind or connect failure (and anything
    ///   else that reaches the top level)
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(1)
    }
}

/// Result type alias for dirsync operations
pub type Result<T> = std::result::Result<T, SyncError>;
