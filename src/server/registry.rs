//! Client registry and per-client session state
//!
//! The registry owns every connected `ClientSession` from accept until
//! disconnect. Only `register`, `unregister` and `snapshot` touch the
//! underlying list, each under a short `parking_lot` lock that is never
//! held across a network send.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};

use crate::error::{Result, SyncError};
use crate::filter::IgnoreSpec;
use crate::server::transfer::Outbound;

/// Unique identifier for a client session (`cli_` + 8 hex digits)
pub type SessionId = String;

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    InitialSync,
    Streaming,
    Closed,
}

/// Server-side state for one connected client
pub struct ClientSession {
    id: SessionId,
    peer: SocketAddr,
    /// Set once the handshake line has been read
    ignore: OnceLock<IgnoreSpec>,
    /// Bounded queue drained by the session's writer task
    outbound: mpsc::Sender<Outbound>,
    state: Mutex<SessionState>,
    alive: AtomicBool,
    closed: Notify,
}

impl ClientSession {
    pub fn new(peer: SocketAddr, outbound: mpsc::Sender<Outbound>) -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("cli_{}", &hex[..8]),
            peer,
            ignore: OnceLock::new(),
            outbound,
            state: Mutex::new(SessionState::Handshaking),
            alive: AtomicBool::new(true),
            closed: Notify::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    /// Record the client's ignore list. Only the first call has an effect.
    pub fn set_ignore(&self, spec: IgnoreSpec) {
        if self.ignore.set(spec).is_err() {
            tracing::debug!("Ignore list for {} already set", self.id);
        }
    }

    pub fn ignore(&self) -> Option<&IgnoreSpec> {
        self.ignore.get()
    }

    /// Handshake done; the session may receive broadcasts
    pub fn is_ready(&self) -> bool {
        self.ignore.get().is_some()
    }

    /// True when the client's ignore list withholds `relative_path`
    pub fn filters_out(&self, relative_path: &str) -> bool {
        self.ignore
            .get()
            .map(|spec| spec.matches(relative_path))
            .unwrap_or(false)
    }

    /// Live, past the handshake, and not ignoring `relative_path`
    pub fn wants(&self, relative_path: &str) -> bool {
        self.is_alive() && self.is_ready() && !self.filters_out(relative_path)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Flag the session for teardown and wake everything waiting on it
    pub fn mark_dead(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            tracing::debug!("Session {} marked dead", self.id);
        }
        self.closed.notify_waiters();
    }

    /// Resolves once the session has been marked dead
    pub async fn closed(&self) {
        loop {
            let notified = self.closed.notified();
            if !self.is_alive() {
                return;
            }
            notified.await;
        }
    }

    /// Queue an item without waiting. A full queue means the client cannot
    /// keep up: the session is marked dead instead of buffering further.
    pub fn enqueue(&self, item: Outbound) -> Result<()> {
        if !self.is_alive() {
            return Err(SyncError::SessionClosed {
                id: self.id.clone(),
            });
        }
        match self.outbound.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.mark_dead();
                Err(SyncError::QueueOverflow {
                    id: self.id.clone(),
                })
            }
            Err(TrySendError::Closed(_)) => {
                self.mark_dead();
                Err(SyncError::SessionClosed {
                    id: self.id.clone(),
                })
            }
        }
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("ignore", &self.ignore.get())
            .field("state", &self.state())
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Registry of all connected clients
pub struct ClientRegistry {
    sessions: RwLock<Vec<Arc<ClientSession>>>,
    max_clients: usize,
}

impl ClientRegistry {
    /// Create a new empty registry
    pub fn new(max_clients: usize) -> Self {
        Self {
            sessions: RwLock::new(Vec::new()),
            max_clients,
        }
    }

    /// Admit a session, or fail with `CapacityExceeded` when full
    pub fn register(&self, session: ClientSession) -> Result<Arc<ClientSession>> {
        let mut sessions = self.sessions.write();
        // Dead sessions wait for their handler to unregister them; they no
        // longer hold a slot
        let live = sessions.iter().filter(|s| s.is_alive()).count();
        if live >= self.max_clients {
            return Err(SyncError::CapacityExceeded {
                max: self.max_clients,
            });
        }
        let session = Arc::new(session);
        sessions.push(Arc::clone(&session));
        tracing::info!(
            "Registered session {} from {} ({}/{})",
            session.id(),
            session.peer(),
            live + 1,
            self.max_clients
        );
        Ok(session)
    }

    /// Remove a session by id
    pub fn unregister(&self, id: &str) -> Option<Arc<ClientSession>> {
        let mut sessions = self.sessions.write();
        let index = sessions.iter().position(|s| s.id() == id)?;
        let session = sessions.remove(index);
        tracing::info!(
            "Unregistered session {} ({} remaining)",
            id,
            sessions.len()
        );
        Some(session)
    }

    /// Live sessions at the time of the call, in registration order
    pub fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        self.sessions
            .read()
            .iter()
            .filter(|s| s.is_alive())
            .cloned()
            .collect()
    }

    /// Registered sessions, including ones waiting to be reaped
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sessions that finished the handshake and are still alive
    pub fn ready_count(&self) -> usize {
        self.sessions
            .read()
            .iter()
            .filter(|s| s.is_alive() && s.is_ready())
            .count()
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }
}
