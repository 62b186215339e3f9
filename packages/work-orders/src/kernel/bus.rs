//! In-process observer bus for committed journal events.
//!
//! Events are published only after the writing transaction commits, so
//! subscribers never observe state that later rolled back.

use tokio::sync::broadcast;

use crate::model::WorkEvent;

const BUS_CAPACITY: usize = 256;

/// Broadcast fan-out of committed events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkEvent> {
        self.tx.subscribe()
    }

    /// Publish a committed event. Lagging or absent subscribers are not an
    /// error; the journal row is the durable record.
    pub fn emit(&self, event: WorkEvent) {
        let _ = self.tx.send(event);
    }

    pub fn emit_all(&self, events: impl IntoIterator<Item = WorkEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
