//! Applies decoded wire messages to the local mirror
//!
//! | Message        | Effect                                            |
//! |----------------|---------------------------------------------------|
//! | `CREATE p/`    | create directory `p` (and parents)                |
//! | `CREATE p`     | nothing; content follows as `FILE`                |
//! | `DELETE p`     | remove `p`; already absent is fine                |
//! | `MOVED_FROM p` | best-effort remove of `p`                         |
//! | `MOVED_TO p`   | nothing; a `CREATE`/`FILE` sequence follows       |
//! | `FILE n p`     | create parents, truncate `p`, expect `n` bytes    |
//! | bytes          | append the chunk to `p` until `n` bytes arrived   |

use std::io;
use std::path::{Component, Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use crate::error::{Result, SyncError};
use crate::protocol::{ProtocolError, WireMessage};

/// What applying one message did to the mirror
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    CreatedDir(PathBuf),
    /// Announced file; its bytes have not arrived yet
    Expecting(PathBuf),
    Removed(PathBuf),
    AlreadyAbsent(PathBuf),
    /// File opened or partly written; more chunks follow
    Receiving(PathBuf),
    Wrote { path: PathBuf, bytes: u64 },
    /// Payload of a refused `FILE` header, dropped
    Discarded,
    Nothing,
}

/// Running totals for one connection
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyStats {
    pub dirs_created: usize,
    pub files_written: usize,
    pub bytes_written: u64,
    pub removed: usize,
}

/// Destination of the payload chunks after a `FILE` header
enum Receiving {
    File {
        path: PathBuf,
        file: File,
        remaining: u64,
        written: u64,
    },
    Discard {
        remaining: u64,
    },
}

pub struct Applier {
    root: PathBuf,
    receiving: Option<Receiving>,
    stats: ApplyStats,
}

impl Applier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            receiving: None,
            stats: ApplyStats::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stats(&self) -> ApplyStats {
        self.stats
    }

    /// Map a wire path to a location under the mirror root.
    ///
    /// Only plain relative components are accepted; anything that could
    /// escape the root is refused.
    pub fn resolve(&self, relative_path: &str) -> Result<PathBuf> {
        let rel = Path::new(relative_path);
        let safe = !relative_path.is_empty()
            && rel
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            return Err(SyncError::UnsafePath {
                path: relative_path.to_string(),
            });
        }
        Ok(self.root.join(rel))
    }

    /// Apply one message. Errors are local to the message; the caller
    /// reports them and keeps reading.
    pub async fn apply(&mut self, msg: WireMessage) -> Result<Applied> {
        match msg {
            WireMessage::Create { path, is_dir: true } => {
                let target = self.resolve(&path)?;
                fs::create_dir_all(&target).await?;
                self.stats.dirs_created += 1;
                Ok(Applied::CreatedDir(target))
            }
            WireMessage::Create {
                path,
                is_dir: false,
            } => Ok(Applied::Expecting(self.resolve(&path)?)),
            WireMessage::Delete { path } => {
                let target = self.resolve(&path)?;
                self.remove(target).await
            }
            WireMessage::MovedFrom { path } => {
                let target = self.resolve(&path)?;
                match self.remove(target.clone()).await {
                    Ok(applied) => Ok(applied),
                    Err(e) => {
                        tracing::debug!("Best-effort remove of {} failed: {}", target.display(), e);
                        Ok(Applied::Nothing)
                    }
                }
            }
            WireMessage::MovedTo { .. } => Ok(Applied::Nothing),
            WireMessage::FileHeader { path, length } => {
                self.abandon().await;
                // Until the target is open, the payload has nowhere to go
                self.receiving = Some(Receiving::Discard { remaining: length });
                let target = self.resolve(&path)?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).await?;
                }
                let file = File::create(&target).await?;
                self.receiving = Some(Receiving::File {
                    path: target.clone(),
                    file,
                    remaining: length,
                    written: 0,
                });
                Ok(Applied::Receiving(target))
            }
            WireMessage::FileBytes(chunk) => self.receive(chunk).await,
        }
    }

    /// Remove a file whose payload will never complete.
    ///
    /// Called when the stream breaks off mid-file, so the mirror does not
    /// keep a truncated copy.
    pub async fn abandon(&mut self) {
        if let Some(Receiving::File {
            path,
            file,
            remaining,
            ..
        }) = self.receiving.take()
        {
            drop(file);
            tracing::warn!(
                "Discarding partial file {} ({} bytes missing)",
                path.display(),
                remaining
            );
            if let Err(e) = fs::remove_file(&path).await {
                tracing::debug!("Could not remove {}: {}", path.display(), e);
            }
        }
    }

    async fn receive(&mut self, chunk: Vec<u8>) -> Result<Applied> {
        let len = chunk.len() as u64;
        match self.receiving.take() {
            None => Err(ProtocolError::UnexpectedFileBytes.into()),
            Some(Receiving::Discard { remaining }) => {
                if remaining > len {
                    self.receiving = Some(Receiving::Discard {
                        remaining: remaining - len,
                    });
                }
                Ok(Applied::Discarded)
            }
            Some(Receiving::File {
                path,
                mut file,
                remaining,
                written,
            }) => {
                if len > remaining {
                    self.receiving = Some(Receiving::File {
                        path,
                        file,
                        remaining,
                        written,
                    });
                    self.abandon().await;
                    return Err(ProtocolError::UnexpectedFileBytes.into());
                }

                let result = async {
                    file.write_all(&chunk).await?;
                    if remaining == len {
                        file.flush().await?;
                    }
                    Ok::<_, io::Error>(())
                }
                .await;

                let remaining = remaining - len;
                self.receiving = Some(Receiving::File {
                    path: path.clone(),
                    file,
                    remaining,
                    written: written + len,
                });
                if let Err(e) = result {
                    // The rest of the payload is still on the wire
                    self.abandon().await;
                    if remaining > 0 {
                        self.receiving = Some(Receiving::Discard { remaining });
                    }
                    return Err(e.into());
                }

                self.stats.bytes_written += len;
                if remaining > 0 {
                    return Ok(Applied::Receiving(path));
                }
                self.receiving = None;
                self.stats.files_written += 1;
                Ok(Applied::Wrote {
                    path,
                    bytes: written + len,
                })
            }
        }
    }

    async fn remove(&mut self, target: PathBuf) -> Result<Applied> {
        let result = match fs::symlink_metadata(&target).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&target).await,
            Ok(_) => fs::remove_file(&target).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                self.stats.removed += 1;
                Ok(Applied::Removed(target))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Applied::AlreadyAbsent(target)),
            Err(e) => Err(e.into()),
        }
    }
}
