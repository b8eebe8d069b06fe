//! Typed creation events flowing from the object store to the notification
//! bridge. The store is the only producer; the bridge owns the receiving end.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

/// What happened to an object version.
///
/// The store emits `Created` for every committed write and `Deleted` when a
/// prior version is pruned (versioning disabled). The bridge forwards only
/// `Created` events to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ObjectEventKind {
    #[serde(rename = "ObjectCreated")]
    Created,
    #[serde(rename = "ObjectDeleted")]
    Deleted,
}

/// A single store event, one per object version affected.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectEvent {
    pub bucket: String,
    pub key: String,
    pub version_id: String,
    pub kind: ObjectEventKind,
    pub event_time: DateTime<Utc>,
}

/// Producer handle for store events.
///
/// Sending is non-blocking and infallible from the store's point of view:
/// once the write is committed, event emission must never fail the upload,
/// so a closed channel is only logged.
#[derive(Clone)]
pub struct EventSender(mpsc::UnboundedSender<ObjectEvent>);

impl EventSender {
    /// Create a connected sender/receiver pair.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ObjectEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    pub fn emit(&self, event: ObjectEvent) {
        if self.0.send(event).is_err() {
            tracing::warn!("event channel closed, dropping store event");
        }
    }
}
