//! Outbound event delivery
//!
//! Every store mutation is published through an [`EventBus`], which fans it out
//! to registered [`EventSink`]s and to a `tokio::sync::broadcast` channel.
//! Delivery is fire-and-forget: a slow or absent listener never blocks a
//! transfer.

use crate::types::{Event, TaskChange};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Listener for task state changes
///
/// Sinks are invoked synchronously while the task store holds its write lock,
/// so per-task delivery order equals transition order. Implementations must
/// return quickly; hand work off to a channel or spawned task if needed.
pub trait EventSink: Send + Sync {
    /// Called for every create, transition and progress flush
    fn on_task_changed(&self, change: &TaskChange);

    /// Called for every event, including the non-task ones
    fn on_event(&self, _event: &Event) {}
}

/// Fan-out of events to sinks and broadcast subscribers
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    sinks: Arc<Vec<Arc<dyn EventSink>>>,
}

impl EventBus {
    /// Create a bus with the given broadcast capacity and sinks
    pub fn new(capacity: usize, sinks: Vec<Arc<dyn EventSink>>) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            sinks: Arc::new(sinks),
        }
    }

    /// Subscribe to the broadcast channel
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Deliver an event to all sinks and subscribers
    pub fn emit(&self, event: Event) {
        for sink in self.sinks.iter() {
            if let Event::TaskChanged(change) = &event {
                sink.on_task_changed(change);
            }
            sink.on_event(&event);
        }
        // send() returns Err if there are no receivers, which is fine
        self.tx.send(event).ok();
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("sinks", &self.sinks.len())
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}
