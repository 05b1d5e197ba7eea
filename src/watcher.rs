//! Recursive file system watcher for the sync root
//!
//! Uses the `notify` crate with one non-recursive watch per directory so
//! that watch registration stays under our control.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐   mpsc    ┌──────────────┐  ChangeEvent  ┌─────────────┐
//! │   notify    │──────────>│ TreeWatcher  │──────────────>│ Broadcaster │
//! │ (OS thread) │ raw event │ (watcher task)│              │             │
//! └─────────────┘           └──────────────┘               └─────────────┘
//! ```
//!
//! When a directory appears (created or moved in), its subtree is registered
//! inside the same processing step, before the event is handed downstream,
//! and synthetic `Created` events are queued for anything already inside it.
//! A `MovedTo` is always followed by a synthetic `Created` for the same path
//! so clients receive the content. Renames are not paired: `MovedFrom` and
//! `MovedTo` are independent events carrying the OS rename cookie when known.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};

use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::{Result, SyncError};
use crate::tree;

/// Raw notify events buffered between the OS thread and the watcher task
const RAW_EVENT_CAPACITY: usize = 4096;

/// Kind of structural change observed under the root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Deleted,
    MovedFrom,
    MovedTo,
    /// File closed after writing
    Modified,
}

/// A single change, relative to the watched root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub relative_path: String,
    pub is_dir: bool,
    /// OS rename cookie, only set on moves
    pub cookie: Option<usize>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, relative_path: impl Into<String>, is_dir: bool) -> Self {
        Self {
            kind,
            relative_path: relative_path.into(),
            is_dir,
            cookie: None,
        }
    }

    pub fn with_cookie(mut self, cookie: Option<usize>) -> Self {
        self.cookie = cookie;
        self
    }
}

/// Watches a directory tree and yields `ChangeEvent`s
pub struct TreeWatcher {
    root: PathBuf,
    watcher: RecommendedWatcher,
    raw_rx: mpsc::Receiver<notify::Result<Event>>,
    watched: HashSet<PathBuf>,
    pending: VecDeque<ChangeEvent>,
}

impl TreeWatcher {
    /// Start watching `root` and every directory below it.
    ///
    /// Failing to watch the root itself is fatal; failing on a
    /// subdirectory is logged and the rest of the tree is still watched.
    pub fn new(root: &Path) -> Result<Self> {
        let root = root.canonicalize().map_err(|e| {
            SyncError::config(format!("cannot resolve sync root {}: {}", root.display(), e))
        })?;

        let (tx, raw_rx) = mpsc::channel(RAW_EVENT_CAPACITY);
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                // Receiver gone means the watcher is being torn down
                let _ = tx.blocking_send(res);
            },
            Config::default(),
        )
        .map_err(|source| SyncError::Watch {
            path: root.clone(),
            source,
        })?;

        let mut this = Self {
            root: root.clone(),
            watcher,
            raw_rx,
            watched: HashSet::new(),
            pending: VecDeque::new(),
        };

        this.watch_dir(&root)?;
        for entry in tree::walk(&root, &root) {
            if entry.is_dir {
                this.watch_dir_or_warn(&entry.path);
            }
        }

        tracing::info!(
            "[WATCHER] Watching {} ({} directories)",
            root.display(),
            this.watched.len()
        );
        Ok(this)
    }

    /// Canonical root all relative paths are computed against
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of directories with an active watch
    pub fn watched_dirs(&self) -> usize {
        self.watched.len()
    }

    pub fn is_watching(&self, dir: &Path) -> bool {
        self.watched.contains(dir)
    }

    /// Next change under the root. Runs until the process exits.
    pub async fn next_event(&mut self) -> Option<ChangeEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            match self.raw_rx.recv().await? {
                Ok(event) => self.translate(event),
                Err(e) => tracing::error!("[WATCHER] Watcher error: {}", e),
            }
        }
    }

    /// Turn one raw notify event into zero or more queued `ChangeEvent`s,
    /// extending or pruning the watch set first.
    fn translate(&mut self, event: Event) {
        tracing::debug!("[WATCHER] Event kind: {:?}, paths: {:?}", event.kind, event.paths);

        if event.need_rescan() {
            tracing::warn!("[WATCHER] Kernel event queue overflowed; some changes were lost");
        }

        let cookie = event.tracker();
        match event.kind {
            EventKind::Create(kind) => {
                for path in event.paths {
                    let is_dir = matches!(kind, CreateKind::Folder) || path.is_dir();
                    self.push(ChangeKind::Created, &path, is_dir, None);
                    if is_dir {
                        self.adopt_subtree(&path);
                    }
                }
            }
            EventKind::Remove(kind) => {
                for path in event.paths {
                    let was_watched = self.forget_subtree(&path);
                    let is_dir = matches!(kind, RemoveKind::Folder) || was_watched;
                    self.push(ChangeKind::Deleted, &path, is_dir, None);
                }
            }
            EventKind::Modify(ModifyKind::Name(mode)) => match mode {
                RenameMode::From => {
                    for path in event.paths {
                        self.moved_from(&path, cookie);
                    }
                }
                RenameMode::To => {
                    for path in event.paths {
                        self.moved_to(&path, cookie);
                    }
                }
                RenameMode::Both => {
                    // Backends that report From and To separately also send
                    // this combined event; the halves were already handled.
                    tracing::debug!("[WATCHER] Ignoring combined rename {:?}", event.paths);
                }
                RenameMode::Any | RenameMode::Other => {
                    for path in event.paths {
                        if path.exists() {
                            self.moved_to(&path, cookie);
                        } else {
                            self.moved_from(&path, cookie);
                        }
                    }
                }
            },
            EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
                for path in event.paths {
                    if path.is_file() {
                        self.push(ChangeKind::Modified, &path, false, None);
                    }
                }
            }
            _ => {}
        }
    }

    fn moved_from(&mut self, path: &Path, cookie: Option<usize>) {
        let was_watched = self.forget_subtree(path);
        self.push(ChangeKind::MovedFrom, path, was_watched, cookie);
    }

    fn moved_to(&mut self, path: &Path, cookie: Option<usize>) {
        let is_dir = path.is_dir();
        self.push(ChangeKind::MovedTo, path, is_dir, cookie);
        self.push(ChangeKind::Created, path, is_dir, None);
        if is_dir {
            self.adopt_subtree(path);
        }
    }

    /// Watch a new directory and everything below it, queueing synthetic
    /// `Created` events for entries that appeared before the watch existed.
    fn adopt_subtree(&mut self, dir: &Path) {
        self.watch_dir_or_warn(dir);
        for entry in tree::walk(&self.root, dir) {
            if entry.is_dir {
                self.watch_dir_or_warn(&entry.path);
            }
            self.pending.push_back(ChangeEvent::new(
                ChangeKind::Created,
                entry.relative_path,
                entry.is_dir,
            ));
        }
    }

    /// Drop watches for `dir` and anything below it; true if `dir` was watched
    fn forget_subtree(&mut self, dir: &Path) -> bool {
        let was_watched = self.watched.contains(dir);
        let stale: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|p| p.starts_with(dir))
            .cloned()
            .collect();
        for path in stale {
            // The kernel usually removed it already
            if let Err(e) = self.watcher.unwatch(&path) {
                tracing::debug!("[WATCHER] unwatch {}: {}", path.display(), e);
            }
            self.watched.remove(&path);
        }
        was_watched
    }

    fn watch_dir(&mut self, dir: &Path) -> Result<()> {
        if self.watched.contains(dir) {
            return Ok(());
        }
        self.watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|source| SyncError::Watch {
                path: dir.to_path_buf(),
                source,
            })?;
        self.watched.insert(dir.to_path_buf());
        Ok(())
    }

    fn watch_dir_or_warn(&mut self, dir: &Path) {
        if let Err(e) = self.watch_dir(dir) {
            tracing::warn!("[WATCHER] {}", e);
        }
    }

    fn push(&mut self, kind: ChangeKind, path: &Path, is_dir: bool, cookie: Option<usize>) {
        match tree::relative_path(&self.root, path) {
            Some(rel) => self
                .pending
                .push_back(ChangeEvent::new(kind, rel, is_dir).with_cookie(cookie)),
            None => tracing::debug!("[WATCHER] Filtered out: {:?}", path),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
