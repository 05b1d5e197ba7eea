//! Fan-out of change events to connected clients
//!
//! `publish` takes a point-in-time snapshot of the registry (the only
//! locked step) and then enqueues to each eligible session without
//! blocking. A failure for one session never affects the others.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Result;
use crate::protocol::WireMessage;
use crate::server::registry::{ClientRegistry, ClientSession};
use crate::server::transfer::{send_file, Outbound};
use crate::watcher::{ChangeEvent, ChangeKind};

/// Per-publish delivery counts
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishStats {
    /// Sessions that got every item for the event
    pub delivered: usize,
    /// Sessions whose ignore list matched the path
    pub filtered: usize,
    /// Sessions that could not accept the event and were dropped
    pub failed: usize,
}

pub struct Broadcaster {
    root: PathBuf,
    registry: Arc<ClientRegistry>,
}

impl Broadcaster {
    pub fn new(root: PathBuf, registry: Arc<ClientRegistry>) -> Self {
        Self { root, registry }
    }

    /// Deliver one event to every interested client
    pub fn publish(&self, event: &ChangeEvent) -> PublishStats {
        let mut stats = PublishStats::default();
        let plan = Plan::for_event(event);
        if plan.is_empty() {
            return stats;
        }

        for session in self.registry.snapshot() {
            if !session.is_ready() {
                continue;
            }
            if session.filters_out(&event.relative_path) {
                stats.filtered += 1;
                continue;
            }

            match self.deliver(&session, &plan, &event.relative_path) {
                Ok(()) => stats.delivered += 1,
                Err(e) => {
                    tracing::warn!("Dropping {} from broadcast: {}", session.id(), e);
                    stats.failed += 1;
                }
            }
        }

        tracing::debug!(
            "Published {:?} {} to {} clients ({} filtered, {} failed)",
            event.kind,
            event.relative_path,
            stats.delivered,
            stats.filtered,
            stats.failed
        );
        stats
    }

    fn deliver(&self, session: &ClientSession, plan: &Plan, relative_path: &str) -> Result<()> {
        if let Some(msg) = &plan.control {
            session.enqueue(Outbound::Control(msg.clone()))?;
        }
        if plan.send_content {
            send_file(session, &self.root, relative_path)?;
        }
        Ok(())
    }
}

/// What a non-ignoring client receives for one event: an optional control
/// line, then optionally the file content
struct Plan {
    control: Option<WireMessage>,
    send_content: bool,
}

impl Plan {
    fn for_event(event: &ChangeEvent) -> Self {
        let path = event.relative_path.clone();
        let (control, send_content) = match event.kind {
            ChangeKind::Created => (
                Some(WireMessage::Create {
                    path,
                    is_dir: event.is_dir,
                }),
                !event.is_dir,
            ),
            ChangeKind::Deleted => (Some(WireMessage::Delete { path }), false),
            ChangeKind::MovedFrom => (Some(WireMessage::MovedFrom { path }), false),
            ChangeKind::MovedTo => (Some(WireMessage::MovedTo { path }), false),
            ChangeKind::Modified => (None, !event.is_dir),
        };
        Self {
            control,
            send_content,
        }
    }

    fn is_empty(&self) -> bool {
        self.control.is_none() && !self.send_content
    }
}
