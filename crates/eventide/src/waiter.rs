//! Version waiters
//!
//! A waiter is a pending completion keyed by target version. The poll loop
//! fires waiters as events commit; firing an event also sweeps every waiter
//! at a lower version, re-reading its row from the queue since another
//! process may have committed it.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::oneshot;

use eventide_core::{Event, EventideError, Result, Version};

use crate::queue::EventQueue;

/// Registry of pending "wake me at version v" completions.
#[derive(Default)]
pub struct WaiterSet {
    waiters: Mutex<BTreeMap<Version, Vec<oneshot::Sender<Event>>>>,
}

/// A registered waiter. Resolves with the processed event, or rejects with
/// [`EventideError::EventFailed`] when the event committed with an error.
pub struct WaiterHandle {
    rx: oneshot::Receiver<Event>,
}

impl WaiterHandle {
    pub async fn wait(self) -> Result<Event> {
        match self.rx.await {
            Ok(event) if event.is_error() => Err(EventideError::EventFailed(Box::new(event))),
            Ok(event) => Ok(event),
            Err(_) => Err(EventideError::Closed),
        }
    }
}

impl WaiterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in version `v`. Multiple callers for the same
    /// version share the slot and all get the same event.
    pub fn register(&self, v: Version) -> WaiterHandle {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().entry(v).or_default().push(tx);
        WaiterHandle { rx }
    }

    pub fn has_pending(&self) -> bool {
        !self.waiters.lock().is_empty()
    }

    /// Fire the waiter at `event.v` with the event itself, and sweep every
    /// waiter at a lower version from the queue.
    pub fn notify(&self, event: &Event, queue: &EventQueue) {
        self.fire_up_to(event.v, queue, Some(event));
    }

    /// Sweep all waiters with `v <= version`, fulfilling each from its
    /// queue row. Runs when a poll pass drains, so events committed by a
    /// peer process still resolve local waiters.
    pub fn sweep_up_to(&self, version: Version, queue: &EventQueue) {
        self.fire_up_to(version, queue, None);
    }

    /// Drop every pending waiter; their futures resolve to `Closed`.
    pub fn fail_all(&self) {
        self.waiters.lock().clear();
    }

    fn fire_up_to(&self, version: Version, queue: &EventQueue, exact: Option<&Event>) {
        let drained = {
            let mut waiters = self.waiters.lock();
            if waiters.is_empty() {
                return;
            }
            let keep = waiters.split_off(&(version + 1));
            std::mem::replace(&mut *waiters, keep)
        };

        for (v, senders) in drained {
            let record = if exact.map(|e| e.v) == Some(v) {
                exact.cloned()
            } else {
                match queue.get(v) {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!(v, error = %e, "failed to re-read swept event");
                        None
                    }
                }
            };

            match record {
                Some(event) => {
                    for tx in senders {
                        let _ = tx.send(event.clone());
                    }
                }
                // no row to fulfill from; dropping the senders resolves the
                // waiters to Closed
                None => drop(senders),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{queue_migration, EventQueue};
    use eventide_core::StoreConfig;
    use eventide_sqlite::{MigrationRunner, SqliteStore};
    use serde_json::json;
    use std::time::Duration;

    fn memory_queue() -> EventQueue {
        let mut migrations = MigrationRunner::new();
        migrations.add(queue_migration());
        let store = SqliteStore::open(StoreConfig::memory(), migrations).unwrap();
        EventQueue::new(store, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn notify_resolves_exact_waiter() {
        let waiters = WaiterSet::new();
        let queue = memory_queue();
        let event = queue.add("A", json!(null), None).unwrap();

        let handle = waiters.register(event.v);
        waiters.notify(&event, &queue);

        let resolved = handle.wait().await.unwrap();
        assert_eq!(resolved.v, event.v);
        assert!(!waiters.has_pending());
    }

    #[tokio::test]
    async fn notify_rejects_with_failed_event() {
        let waiters = WaiterSet::new();
        let queue = memory_queue();
        let mut event = queue.add("A", json!(null), None).unwrap();
        event.set_error("reduce_foo", "boom");

        let handle = waiters.register(event.v);
        waiters.notify(&event, &queue);

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, EventideError::EventFailed(e) if e.v == event.v));
    }

    #[tokio::test]
    async fn later_event_sweeps_earlier_waiters_from_the_queue() {
        let waiters = WaiterSet::new();
        let queue = memory_queue();
        let first = queue.add("A", json!(1), None).unwrap();
        let second = queue.add("B", json!(2), None).unwrap();

        let early = waiters.register(first.v);
        waiters.notify(&second, &queue);

        // fulfilled from the stored row, not the notifying event
        let resolved = early.wait().await.unwrap();
        assert_eq!(resolved.v, first.v);
        assert_eq!(resolved.event_type, "A");
    }

    #[tokio::test]
    async fn multiple_waiters_share_a_version() {
        let waiters = WaiterSet::new();
        let queue = memory_queue();
        let event = queue.add("A", json!(null), None).unwrap();

        let one = waiters.register(event.v);
        let two = waiters.register(event.v);
        waiters.notify(&event, &queue);

        assert_eq!(one.wait().await.unwrap().v, event.v);
        assert_eq!(two.wait().await.unwrap().v, event.v);
    }

    #[tokio::test]
    async fn fail_all_resolves_to_closed() {
        let waiters = WaiterSet::new();
        let handle = waiters.register(5);
        waiters.fail_all();
        assert!(matches!(handle.wait().await, Err(EventideError::Closed)));
    }
}
