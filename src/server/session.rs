//! Server-side session handler
//!
//! One task per connection drives the session through
//! `Handshaking -> InitialSync -> Streaming -> Closed`:
//!
//! 1. Read the client's ignore list (one bounded line).
//! 2. Walk the tree and write the snapshot straight to the connection.
//!    The session is already a broadcast target at this point, so live
//!    events queue up behind the snapshot instead of being lost.
//! 3. Hand the connection to the writer task and drain inbound bytes
//!    until the client goes away.
//! 4. Unregister and release the connection.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, BufReader, BufWriter};
use tokio::sync::mpsc;

use crate::config::ServerOptions;
use crate::error::{Result, SyncError};
use crate::filter::IgnoreSpec;
use crate::protocol::{read_bounded_line, RawLine, WireMessage};
use crate::server::registry::{ClientRegistry, ClientSession, SessionState};
use crate::server::transfer::{run_writer, write_outbound, Outbound, TransferOutcome};
use crate::tree;

/// Shared, read-only state every session needs
pub struct ServerContext {
    /// Canonical sync root
    pub root: PathBuf,
    pub registry: Arc<ClientRegistry>,
    pub options: ServerOptions,
}

/// Read the handshake line. Never fails: anything other than a complete
/// line within the timeout yields an empty ignore list.
pub async fn read_handshake<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    options: &ServerOptions,
) -> IgnoreSpec {
    let read = read_bounded_line(reader, options.max_line_len);
    match tokio::time::timeout(options.handshake_timeout(), read).await {
        Ok(Ok(Some(RawLine::Line(line)))) => IgnoreSpec::parse(&line),
        Ok(Ok(Some(RawLine::TooLong))) => {
            tracing::warn!(
                "Handshake longer than {} bytes; using empty ignore list",
                options.max_line_len
            );
            IgnoreSpec::default()
        }
        Ok(Ok(Some(RawLine::NotUtf8))) => {
            tracing::warn!("Handshake is not UTF-8; using empty ignore list");
            IgnoreSpec::default()
        }
        Ok(Ok(None)) => {
            tracing::debug!("Client closed before handshake; using empty ignore list");
            IgnoreSpec::default()
        }
        Ok(Err(e)) => {
            tracing::warn!("Handshake read failed: {}; using empty ignore list", e);
            IgnoreSpec::default()
        }
        Err(_) => {
            tracing::warn!(
                "No handshake within {:?}; using empty ignore list",
                options.handshake_timeout()
            );
            IgnoreSpec::default()
        }
    }
}

/// Every item a newly joined client needs to match the current tree,
/// parents before children, honoring its ignore list.
pub async fn snapshot_items(root: &Path, session: &ClientSession) -> Result<Vec<Outbound>> {
    let walk_root = root.to_path_buf();
    let entries = tokio::task::spawn_blocking(move || tree::walk(&walk_root, &walk_root))
        .await
        .map_err(|e| SyncError::Io(io::Error::new(io::ErrorKind::Other, e)))?;

    let mut items = Vec::with_capacity(entries.len() * 2);
    for entry in entries {
        if session.filters_out(&entry.relative_path) {
            continue;
        }
        items.push(Outbound::Control(WireMessage::Create {
            path: entry.relative_path.clone(),
            is_dir: entry.is_dir,
        }));
        if !entry.is_dir {
            items.push(Outbound::File {
                relative_path: entry.relative_path,
                source: entry.path,
            });
        }
    }
    Ok(items)
}

/// What the initial sync delivered
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InitialSyncStats {
    pub lines: usize,
    pub files: usize,
    pub bytes: u64,
    /// Files that vanished or became unreadable before they were sent
    pub skipped: usize,
}

/// Write the initial snapshot to the client.
///
/// Every write must make progress within `send_timeout`; a stalled client
/// is an error. Large files are fine as long as the client keeps reading.
pub async fn initial_sync<W: AsyncWrite + Unpin>(
    writer: &mut W,
    root: &Path,
    session: &ClientSession,
    send_timeout: Duration,
) -> Result<InitialSyncStats> {
    let items = snapshot_items(root, session).await?;
    let mut stats = InitialSyncStats::default();

    for item in &items {
        if !session.is_alive() {
            return Err(SyncError::SessionClosed {
                id: session.id().to_string(),
            });
        }
        match write_outbound(&mut *writer, item, send_timeout).await? {
            TransferOutcome::Line => stats.lines += 1,
            TransferOutcome::Sent { bytes } => {
                stats.files += 1;
                stats.bytes += bytes;
            }
            TransferOutcome::Skipped => stats.skipped += 1,
        }
    }
    Ok(stats)
}

/// Drive one registered session until the client disconnects.
///
/// The session is unregistered on every exit path.
pub async fn handle_connection<S>(
    stream: S,
    session: Arc<ClientSession>,
    outbound_rx: mpsc::Receiver<Outbound>,
    ctx: Arc<ServerContext>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    // Handshaking
    let ignore = read_handshake(&mut reader, &ctx.options).await;
    tracing::info!(
        "Session {} handshake complete (ignore: {:?})",
        session.id(),
        ignore.patterns()
    );
    session.set_ignore(ignore);

    // InitialSync
    session.set_state(SessionState::InitialSync);
    let synced = tokio::select! {
        biased;
        _ = session.closed() => Err(SyncError::SessionClosed { id: session.id().to_string() }),
        result = initial_sync(&mut writer, &ctx.root, &session, ctx.options.send_timeout()) => result,
    };

    match synced {
        Ok(stats) => {
            tracing::info!(
                "Session {} initial sync sent {} entries and {} files ({} bytes, {} skipped)",
                session.id(),
                stats.lines,
                stats.files,
                stats.bytes,
                stats.skipped
            );

            // Streaming
            session.set_state(SessionState::Streaming);
            let writer_task = tokio::spawn(run_writer(
                writer,
                outbound_rx,
                Arc::clone(&session),
                ctx.options.send_timeout(),
            ));
            drain_until_closed(&mut reader, &session).await;
            session.mark_dead();
            writer_task.abort();
        }
        Err(e) => {
            tracing::warn!("Session {} initial sync failed: {}", session.id(), e);
        }
    }

    // Closed
    session.mark_dead();
    session.set_state(SessionState::Closed);
    ctx.registry.unregister(session.id());
    tracing::info!("Session {} from {} closed", session.id(), session.peer());
}

/// Discard inbound bytes until EOF, a read error, or the session dying
/// from the writer side.
async fn drain_until_closed<R: AsyncRead + Unpin>(reader: &mut R, session: &ClientSession) {
    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            biased;
            _ = session.closed() => return,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::debug!("Session {} reached EOF", session.id());
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("Session {} read failed: {}", session.id(), e);
                    return;
                }
            },
        }
    }
}
