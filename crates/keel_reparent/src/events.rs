//! Reparent event stream.
//!
//! Observers subscribe to a broadcast channel and receive a snapshot of the
//! `Reparent` event at every status transition. Dispatch is best-effort: no
//! subscribers is fine, and lagging subscribers lose intermediate updates
//! rather than slowing the operation down.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::topology::{ShardInfo, Tablet};

/// Progress record of one emergency reparent operation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reparent {
    pub shard_info: Option<ShardInfo>,
    pub new_primary: Option<Tablet>,
    pub status: String,
}

/// Fan-out for `Reparent` updates.
#[derive(Clone, Debug)]
pub struct EventDispatcher {
    tx: broadcast::Sender<Reparent>,
}

impl EventDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Reparent> {
        self.tx.subscribe()
    }

    /// Stamp a new status on the event and broadcast a snapshot of it.
    pub fn update(&self, ev: &mut Reparent, status: impl Into<String>) {
        ev.status = status.into();
        tracing::debug!(status = %ev.status, "reparent event");
        let _ = self.tx.send(ev.clone());
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(64)
    }
}
