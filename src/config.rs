//! dirsync configuration management.
//!
//! Optional TOML file, looked up in this order:
//! - `--config <file>` / `DIRSYNC_CONFIG`
//! - Linux: `~/.config/dirsync/config.toml` (platform config dir elsewhere)
//! - built-in defaults
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! send_timeout_ms = 5000
//! queue_capacity = 1024
//!
//! [client]
//! host = "127.0.0.1"
//! port = 8080
//!
//! [logging]
//! level = "debug"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SyncError};
use crate::filter::IgnoreSpec;
use crate::protocol::DEFAULT_MAX_LINE_LEN;

/// Top-level configuration file
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SyncConfig {
    #[serde(default)]
    pub server: ServerOptions,

    #[serde(default)]
    pub client: ClientOptions,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server tuning knobs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Interface to bind
    pub host: String,
    /// Upper bound for writing one outbound item to a client
    pub send_timeout_ms: u64,
    /// Outbound queue length per client before it is disconnected
    pub queue_capacity: usize,
    /// How long to wait for the ignore-list line
    pub handshake_timeout_ms: u64,
    /// Longest accepted handshake line
    pub max_line_len: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            send_timeout_ms: 5000,
            queue_capacity: 1024,
            handshake_timeout_ms: 5000,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

impl ServerOptions {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Client connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    /// Longest accepted control line
    pub max_line_len: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default level when RUST_LOG is unset (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SyncConfig {
    /// Default config file location for this platform
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("dirsync").join("config.toml"))
    }

    /// Load from an explicit path, or the default location, or defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(SyncError::config(format!(
                        "config file not found: {}",
                        path.display()
                    )));
                }
                Self::load_from(path)
            }
            None => match Self::default_path() {
                Some(path) => Self::load_from(&path),
                None => Ok(Self::default()),
            },
        }
    }

    /// Load configuration from a specific path; missing file means defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            SyncError::config(format!("failed to read {}: {}", path.display(), e))
        })?;

        Self::parse(&content)
            .map_err(|e| SyncError::config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

/// Everything the server needs to start
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub root: PathBuf,
    pub port: u16,
    pub max_clients: usize,
    pub options: ServerOptions,
}

impl ServerConfig {
    pub fn new(root: impl Into<PathBuf>, port: u16, max_clients: usize) -> Self {
        Self {
            root: root.into(),
            port,
            max_clients,
            options: ServerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    /// Reject arguments that can never work before touching the network
    pub fn validate(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(SyncError::config(format!(
                "sync root is not a directory: {}",
                self.root.display()
            )));
        }
        if self.max_clients == 0 {
            return Err(SyncError::config("max-clients must be at least 1"));
        }
        if self.options.queue_capacity == 0 {
            return Err(SyncError::config("queue_capacity must be at least 1"));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.options.host, self.port)
    }
}

/// Everything the client needs to start
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub root: PathBuf,
    pub ignore: IgnoreSpec,
    pub options: ClientOptions,
}

impl ClientConfig {
    pub fn new(root: impl Into<PathBuf>, ignore: IgnoreSpec, options: ClientOptions) -> Self {
        Self {
            root: root.into(),
            ignore,
            options,
        }
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.options.host, self.options.port)
    }
}

/// Read an ignore-list file. Unreadable files are a configuration error.
pub fn load_ignore_file(path: &Path) -> Result<IgnoreSpec> {
    let contents = fs::read_to_string(path).map_err(|e| {
        SyncError::config(format!(
            "failed to read ignore list {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(IgnoreSpec::parse_file_contents(&contents))
}
