//! Broadcast-backed event bus with a registered-handler dispatcher.

use crate::{DomainEvent, WireEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Boxed in-process handler for a single event type.
pub type Handler = Arc<dyn Fn(&WireEvent) + Send + Sync>;

/// In-process event bus for one process.
///
/// Holds the broadcast sender every streaming connection subscribes to,
/// plus a registry of per-event-type handlers serviced by a background
/// dispatch task. Publishing is non-blocking; with no receivers the event
/// is dropped. Durable delivery is the watch tables' job, not the bus's.
pub struct EventBus {
    tx: broadcast::Sender<WireEvent>,
    handlers: Mutex<HashMap<String, Vec<Handler>>>,
}

impl EventBus {
    /// Create a bus with the given broadcast capacity. Slow subscribers
    /// past the capacity lag and skip events.
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(capacity);
        let bus = Arc::new(Self {
            tx,
            handlers: Mutex::new(HashMap::new()),
        });
        bus.clone().spawn_dispatcher();
        bus
    }

    /// Publish an event for a teambook. Never fails: with no receivers the
    /// event is simply dropped.
    pub fn publish(&self, teambook: &str, event: DomainEvent) {
        let wire = WireEvent::new(teambook, event);
        let event_type = wire.event.event_type();
        match self.tx.send(wire) {
            Ok(receivers) => {
                debug!(event_type, receivers, "published event");
            }
            Err(_) => {
                debug!(event_type, "no receivers for event");
            }
        }
    }

    /// Inject an event that arrived from a remote pub/sub channel, so local
    /// handlers and streams observe cross-process mutations too.
    pub fn inject_remote(&self, wire: WireEvent) {
        let _ = self.tx.send(wire);
    }

    /// Subscribe to the raw event stream (streaming surface, tests).
    pub fn subscribe(&self) -> broadcast::Receiver<WireEvent> {
        self.tx.subscribe()
    }

    /// Register an in-process handler for one event type. Handlers run on
    /// the dispatcher task; they must not block.
    pub fn on(&self, event_type: impl Into<String>, handler: Handler) {
        let mut handlers = self.handlers.lock().expect("handler registry poisoned");
        handlers.entry(event_type.into()).or_default().push(handler);
    }

    fn dispatch(&self, wire: &WireEvent) {
        let handlers = self.handlers.lock().expect("handler registry poisoned");
        if let Some(list) = handlers.get(wire.event.event_type()) {
            for handler in list {
                handler(wire);
            }
        }
    }

    /// Background task that drains the broadcast channel into registered
    /// handlers, mirroring a pub/sub listener loop.
    fn spawn_dispatcher(self: Arc<Self>) {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(wire) => self.dispatch(&wire),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event dispatcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

/// Cheap clonable handle hosts pass around.
pub type EventBusHandle = Arc<EventBus>;

/// Receiver alias used by the streaming surface.
pub type SubscriberStream = broadcast::Receiver<WireEvent>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use teambook_core::{AiId, NoteId};

    fn note_created(id: i64) -> DomainEvent {
        DomainEvent::NoteCreated {
            note_id: NoteId::from(id),
            author: AiId::from("alpha-001"),
            note_type: "general".to_string(),
            summary: None,
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish("demo", note_created(1));
        let wire = rx.recv().await.expect("receive");
        assert_eq!(wire.teambook, "demo");
        assert_eq!(wire.event.event_type(), "note_created");
    }

    #[tokio::test]
    async fn test_publish_without_receivers_is_fine() {
        let bus = EventBus::new(4);
        // The dispatcher task holds one receiver, so this must not panic
        // even before any external subscriber exists.
        bus.publish("demo", note_created(2));
    }

    #[tokio::test]
    async fn test_handler_dispatch() {
        let bus = EventBus::new(16);
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        bus.on(
            "note_created",
            Arc::new(move |_wire| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bus.publish("demo", note_created(3));
        // Other event types do not reach the handler.
        bus.publish(
            "demo",
            DomainEvent::LockReleased {
                resource_id: "r".to_string(),
                released_by: AiId::from("alpha-001"),
            },
        );
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inject_remote() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.inject_remote(WireEvent::new("other", note_created(9)));
        let wire = rx.recv().await.expect("receive");
        assert_eq!(wire.teambook, "other");
    }
}
