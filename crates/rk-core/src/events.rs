//! Application event system.
//!
//! [`EventBus`] wraps a `tokio::sync::broadcast` channel. Workers publish
//! [`EventPayload::JobStatusChanged`] here; nothing crosses the worker
//! boundary by direct method call. Subscribers only see events sent after
//! they subscribe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ids::{ItemId, JobId, LibraryId};
use crate::media::{JobKind, JobStatus, JobTarget};

// ---------------------------------------------------------------------------
// EventPayload
// ---------------------------------------------------------------------------

/// Payload describing what happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    // -- Job lifecycle -------------------------------------------------------
    /// Emitted exactly once per job state transition. `from` is `None` for
    /// the initial `Queued` state.
    JobStatusChanged {
        job_id: JobId,
        kind: JobKind,
        target: JobTarget,
        from: Option<JobStatus>,
        to: JobStatus,
        attempt: u32,
        reason: Option<String>,
    },

    // -- Library lifecycle ---------------------------------------------------
    LibraryCreated {
        library_id: LibraryId,
        name: String,
    },
    LibraryScanComplete {
        library_id: LibraryId,
        files_found: u64,
        items_added: u64,
    },

    // -- Item lifecycle ------------------------------------------------------
    ItemAdded {
        item_id: ItemId,
        library_id: LibraryId,
        title: String,
    },
    ItemUpdated {
        item_id: ItemId,
    },
    ItemRemoved {
        item_id: ItemId,
    },

    // -- Maintenance ---------------------------------------------------------
    CacheSwept {
        removed: u64,
    },
    JobsCollected {
        removed: u64,
    },
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A timestamped event ready for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier.
    pub id: Uuid,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub payload: EventPayload,
}

impl Event {
    /// Create a new event with a fresh UUID and the current timestamp.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus buffering up to `capacity` events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to the broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Broadcast an event to all current subscribers.
    pub fn broadcast(&self, payload: EventPayload) {
        // No subscribers is fine.
        let _ = self.tx.send(Event::new(payload));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
