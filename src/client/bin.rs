//! dirsync client binary
//!
//! Mirrors a server's directory tree into a local root.
//!
//! # Usage
//!
//! ```bash
//! sync-client ./mirror ignore.txt --host 10.0.0.5 --port 8080
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use dirsync::config::{load_ignore_file, ClientConfig, SyncConfig};
use dirsync::logging::init_logging;
use dirsync::{SyncClient, SyncError};

/// dirsync mirroring client
#[derive(Parser, Debug)]
#[command(name = "sync-client")]
#[command(about = "Mirror a dirsync server's tree into a local directory", version)]
struct Args {
    /// Local directory to mirror into (created if missing)
    root: PathBuf,

    /// File with comma-separated substring patterns to skip
    ignore_list: PathBuf,

    /// Server host (overrides the config file)
    #[arg(long, env = "DIRSYNC_HOST")]
    host: Option<String>,

    /// Server port (overrides the config file)
    #[arg(long, env = "DIRSYNC_PORT")]
    port: Option<u16>,

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

    // Unreadable ignore list is fatal before any network activity
    let ignore = match load_ignore_file(&args.ignore_list) {
        Ok(ignore) => ignore,
        Err(e) => {
            eprintln!("Error: {}", e);
            return e.exit_code();
        }
    };

    let mut options = config.client;
    if let Some(host) = args.host {
        options.host = host;
    }
    if let Some(port) = args.port {
        options.port = port;
    }
    let client = SyncClient::new(ClientConfig::new(args.root, ignore, options));

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(client)) {
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

async fn run(client: SyncClient) -> anyhow::Result<()> {
    tracing::info!(
        "Starting sync-client v{} into {}",
        env!("CARGO_PKG_VERSION"),
        client.root().display()
    );

    tokio::select! {
        result = client.run() => {
            result.context("mirroring stopped")?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            tracing::info!("Interrupted; stopping");
        }
    }
    Ok(())
}
