//! dirsync server binary
//!
//! Watches a directory and replicates every change to connected clients.
//!
//! # Usage
//!
//! ```bash
//! sync-server /srv/shared 8080 16
//! sync-server /srv/shared 8080 16 --host 127.0.0.1
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use dirsync::config::{ServerConfig, SyncConfig};
use dirsync::logging::init_logging;
use dirsync::server::SyncServer;
use dirsync::SyncError;

/// dirsync replication server
#[derive(Parser, Debug)]
#[command(name = "sync-server")]
#[command(about = "Replicate a directory tree to connected clients", version)]
struct Args {
    /// Directory to watch and replicate
    root: PathBuf,

    /// Port to listen on
    port: u16,

    /// Maximum number of concurrently connected clients
    max_clients: usize,

    /// Interface to bind (overrides the config file)
    #[arg(long, env = "DIRSYNC_HOST")]
    host: Option<String>,

    /// Config file (default: <config dir>/dirsync/config.toml)
    #[arg(long, env = "DIRSYNC_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let config = match SyncConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return e.exit_code();
        }
    };
    if let Err(e) = init_logging(&config.logging) {
        eprintln!("Error: {}", e);
        return e.exit_code();
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(args, config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<SyncError>()
                .map(SyncError::exit_code)
                .unwrap_or(ExitCode::from(1))
        }
    }
}

async fn run(args: Args, config: SyncConfig) -> anyhow::Result<()> {
    let mut options = config.server;
    if let Some(host) = args.host {
        options.host = host;
    }

    let server = SyncServer::new(
        ServerConfig::new(args.root, args.port, args.max_clients).with_options(options),
    )?;
    let listener = server.bind().await?;

    tracing::info!(
        "Starting sync-server v{} for {}",
        env!("CARGO_PKG_VERSION"),
        server.root().display()
    );

    tokio::select! {
        result = server.serve(listener) => result.context("server stopped")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            tracing::info!(
                "Shutting down ({} clients connected)",
                server.registry().len()
            );
        }
    }
    Ok(())
}
