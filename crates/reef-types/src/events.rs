//! Type-safe event bus for intra-node notifications.
//!
//! Components emit typed events (a repair job finished, a range was
//! recorded in history) and anything interested subscribes by type. Each
//! event type gets its own lazily created `tokio::sync::broadcast` channel.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::warn;

use crate::{NodeId, RepairStatus, StreamReason, TableId, TokenRange};

/// Marker trait for everything that can travel through the [`EventBus`].
pub trait Event: Any + Send + Sync + Clone + std::fmt::Debug + 'static {}

/// A repair job was accepted by the service.
#[derive(Clone, Debug)]
pub struct RepairJobStarted {
    /// Numeric job id handed back to the caller.
    pub job_id: i32,
    /// Keyspace being repaired.
    pub keyspace: String,
    /// Number of (range, table) units in the job.
    pub ranges: usize,
}
impl Event for RepairJobStarted {}

/// A repair job reached a terminal status.
#[derive(Clone, Debug)]
pub struct RepairJobFinished {
    /// Numeric job id.
    pub job_id: i32,
    /// Final status.
    pub status: RepairStatus,
}
impl Event for RepairJobFinished {}

/// A range of a table was recorded complete in the repair history.
#[derive(Clone, Debug)]
pub struct RangeRepaired {
    /// The table.
    pub table_id: TableId,
    /// The range.
    pub range: TokenRange,
    /// Why the data moved.
    pub reason: StreamReason,
}
impl Event for RangeRepaired {}

/// Rows were streamed to a peer during a session.
#[derive(Clone, Debug)]
pub struct RowsStreamed {
    /// Receiving peer.
    pub peer: NodeId,
    /// The table.
    pub table_id: TableId,
    /// Number of rows in the message.
    pub rows: usize,
}
impl Event for RowsStreamed {}

/// A session ended in a non-success state.
#[derive(Clone, Debug)]
pub struct SessionFailed {
    /// The other side of the session.
    pub peer: NodeId,
    /// Session id.
    pub repair_meta_id: u32,
    /// Rendered error.
    pub error: String,
}
impl Event for SessionFailed {}

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A type-safe event bus. Cheap to clone; emits never block.
#[derive(Clone, Default)]
pub struct EventBus {
    channels: Arc<Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>>,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Send an event to current subscribers of `E`. Dropped when nobody listens.
    pub fn emit<E: Event>(&self, event: E) {
        let channels = self.channels.lock().expect("event bus lock poisoned");
        if let Some(sender) = channels
            .get(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast_ref::<broadcast::Sender<E>>())
        {
            let _ = sender.send(event);
        }
    }

    /// Subscribe to events of type `E`.
    pub fn subscribe<E: Event>(&self) -> EventReceiver<E> {
        let mut channels = self.channels.lock().expect("event bus lock poisoned");
        let sender = channels
            .entry(TypeId::of::<E>())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel::<E>(DEFAULT_CHANNEL_CAPACITY);
                Box::new(tx)
            })
            .downcast_ref::<broadcast::Sender<E>>()
            .expect("type mismatch in event bus");
        EventReceiver {
            rx: sender.subscribe(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels = self.channels.lock().expect("event bus lock poisoned");
        f.debug_struct("EventBus")
            .field("channel_count", &channels.len())
            .finish()
    }
}

/// Typed receiver for one event type.
pub struct EventReceiver<E: Event> {
    rx: broadcast::Receiver<E>,
}

impl<E: Event> EventReceiver<E> {
    /// Wait for the next event; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        skipped = n,
                        event_type = std::any::type_name::<E>(),
                        "event receiver lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Return an already delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
