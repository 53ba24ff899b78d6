//! Observer channels
//!
//! Typed broadcast streams for processed events: `result` (successes),
//! `error` (failures) and `handled` (both, in commit order). Subscribers
//! that lag or disappear never affect the engine; a slow receiver drops its
//! oldest buffered events, it does not block the poll loop.

use tokio::sync::broadcast;

use eventide_core::Event;

const CHANNEL_CAPACITY: usize = 128;

/// Broadcast hub for processing outcomes.
#[derive(Clone)]
pub struct ObserverHub {
    result_tx: broadcast::Sender<Event>,
    error_tx: broadcast::Sender<Event>,
    handled_tx: broadcast::Sender<Event>,
}

impl ObserverHub {
    pub fn new() -> Self {
        let (result_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (error_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (handled_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            result_tx,
            error_tx,
            handled_tx,
        }
    }

    /// Successfully processed events.
    pub fn on_result(&self) -> broadcast::Receiver<Event> {
        self.result_tx.subscribe()
    }

    /// Events that committed with an error map.
    pub fn on_error(&self) -> broadcast::Receiver<Event> {
        self.error_tx.subscribe()
    }

    /// Every processed event, success or failure, in commit order.
    pub fn on_handled(&self) -> broadcast::Receiver<Event> {
        self.handled_tx.subscribe()
    }

    /// Publish a processing outcome. Send failures mean nobody is
    /// subscribed and are ignored.
    pub fn emit(&self, event: &Event) {
        if event.is_error() {
            let _ = self.error_tx.send(event.clone());
        } else {
            let _ = self.result_tx.send(event.clone());
        }
        let _ = self.handled_tx.send(event.clone());
    }
}

impl Default for ObserverHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[tokio::test]
    async fn routes_success_and_failure() {
        let hub = ObserverHub::new();
        let mut results = hub.on_result();
        let mut errors = hub.on_error();
        let mut handled = hub.on_handled();

        let ok = Event::new(1, "A", Value::Null, 0);
        let mut bad = Event::new(2, "B", Value::Null, 0);
        bad.set_error("reduce_x", "boom");

        hub.emit(&ok);
        hub.emit(&bad);

        assert_eq!(results.recv().await.unwrap().v, 1);
        assert_eq!(errors.recv().await.unwrap().v, 2);
        assert_eq!(handled.recv().await.unwrap().v, 1);
        assert_eq!(handled.recv().await.unwrap().v, 2);
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let hub = ObserverHub::new();
        hub.emit(&Event::new(1, "A", Value::Null, 0));
    }
}
