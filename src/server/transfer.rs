//! File transfer and the per-session outbound writer
//!
//! Everything sent to a client goes through its bounded outbound queue and
//! is written by a single writer task. A `File` item is written as the
//! `FILE <length> <path>` header immediately followed by the raw bytes, so
//! no other message can land between a header and its payload.
//!
//! File content is streamed in `FILE_CHUNK_LEN` pieces and each write must
//! make progress within the send timeout. A slow but steady client keeps
//! receiving however large the file is; a stalled one is dropped.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;

use crate::error::{Result, SyncError};
use crate::protocol::{write_message, WireMessage, FILE_CHUNK_LEN};
use crate::server::registry::ClientSession;

/// One unit of outbound work for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A single control line
    Control(WireMessage),
    /// Header plus full content of `source`, read when it is written
    File {
        relative_path: String,
        source: PathBuf,
    },
}

impl Outbound {
    pub fn file(root: &Path, relative_path: &str) -> Self {
        Self::File {
            relative_path: relative_path.to_string(),
            source: root.join(relative_path),
        }
    }

    pub fn relative_path(&self) -> Option<&str> {
        match self {
            Self::Control(msg) => msg.path(),
            Self::File { relative_path, .. } => Some(relative_path),
        }
    }
}

/// Result of writing one outbound item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// A control line
    Line,
    Sent { bytes: u64 },
    /// Source could not be opened; nothing was written
    Skipped,
}

/// Schedule a transfer of `relative_path` to one client.
///
/// Returns `Ok(false)` when the client's ignore list withholds the path.
pub fn send_file(session: &ClientSession, root: &Path, relative_path: &str) -> Result<bool> {
    if !session.wants(relative_path) {
        return Ok(false);
    }
    session.enqueue(Outbound::file(root, relative_path))?;
    Ok(true)
}

/// Run one write step, failing if it makes no progress within `limit`
async fn with_deadline<T, F>(limit: Duration, step: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, step).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no write progress for {:?}", limit),
        ))),
    }
}

/// Write header and bytes for one file.
///
/// The announced length is the file's size when opened. A missing or
/// unreadable source (deleted since the event, permission denied) skips
/// this transfer only. Once the header is out, failing to deliver exactly
/// that many bytes is fatal for the connection.
pub async fn write_file<W: AsyncWrite + Unpin>(
    writer: &mut W,
    relative_path: &str,
    source: &Path,
    send_timeout: Duration,
) -> Result<TransferOutcome> {
    let opened = async {
        let file = tokio::fs::File::open(source).await?;
        let meta = file.metadata().await?;
        Ok::<_, io::Error>((file, meta))
    };
    let (file, length) = match opened.await {
        Ok((file, meta)) if meta.is_file() => (file, meta.len()),
        Ok(_) => {
            tracing::warn!("Skipping transfer of {}: not a regular file", relative_path);
            return Ok(TransferOutcome::Skipped);
        }
        Err(e) => {
            tracing::warn!("Skipping transfer of {}: {}", relative_path, e);
            return Ok(TransferOutcome::Skipped);
        }
    };

    let header = WireMessage::FileHeader {
        path: relative_path.to_string(),
        length,
    };
    with_deadline(send_timeout, write_message(writer, &header)).await?;
    copy_exact(file, writer, length, send_timeout).await?;
    Ok(TransferOutcome::Sent { bytes: length })
}

/// Copy exactly `length` bytes from `source` to `writer` in chunks.
///
/// Each chunk must be written within `send_timeout`. A source that ends
/// early (the file shrank after its size was taken) is an error, since the
/// receiver is still waiting for the rest of the announced payload. Extra
/// bytes past `length` are never read.
pub async fn copy_exact<R, W>(
    source: R,
    writer: &mut W,
    length: u64,
    send_timeout: Duration,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut source = source.take(length);
    let mut buf = vec![0u8; length.min(FILE_CHUNK_LEN as u64) as usize];
    let mut remaining = length;

    while remaining > 0 {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            return Err(SyncError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("source ended {} bytes short of the announced length", remaining),
            )));
        }
        let chunk = &buf[..n];
        with_deadline(send_timeout, async {
            Ok::<_, SyncError>(writer.write_all(chunk).await?)
        })
        .await?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Write a single queued item and flush it
pub async fn write_outbound<W: AsyncWrite + Unpin>(
    writer: &mut W,
    item: &Outbound,
    send_timeout: Duration,
) -> Result<TransferOutcome> {
    let outcome = match item {
        Outbound::Control(msg) => {
            with_deadline(send_timeout, write_message(writer, msg)).await?;
            TransferOutcome::Line
        }
        Outbound::File {
            relative_path,
            source,
        } => write_file(writer, relative_path, source, send_timeout).await?,
    };
    with_deadline(send_timeout, async { Ok::<_, SyncError>(writer.flush().await?) }).await?;
    Ok(outcome)
}

/// Drain a session's outbound queue onto its connection.
///
/// Every write must make progress within `send_timeout`; a stalled client
/// or a write error ends the session. Runs until the queue closes or the
/// session is marked dead.
pub async fn run_writer<W: AsyncWrite + Unpin>(
    writer: W,
    mut rx: mpsc::Receiver<Outbound>,
    session: Arc<ClientSession>,
    send_timeout: Duration,
) {
    let mut writer = BufWriter::new(writer);
    let mut skipped = 0usize;

    loop {
        let item = tokio::select! {
            biased;
            _ = session.closed() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        if item
            .relative_path()
            .map(|path| session.filters_out(path))
            .unwrap_or(false)
        {
            continue;
        }

        match write_outbound(&mut writer, &item, send_timeout).await {
            Ok(TransferOutcome::Sent { bytes }) => {
                tracing::trace!("Sent {} bytes to {}", bytes, session.id());
            }
            Ok(TransferOutcome::Skipped) => skipped += 1,
            Ok(TransferOutcome::Line) => {}
            Err(e) => {
                tracing::warn!("Send to {} failed: {}; disconnecting", session.id(), e);
                break;
            }
        }
    }

    if skipped > 0 {
        tracing::debug!("{} skipped {} unreadable files", session.id(), skipped);
    }
    // No shutdown here: flushing to a stalled peer would block forever
    session.mark_dead();
}
