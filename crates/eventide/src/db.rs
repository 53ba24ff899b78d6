//! Unified engine interface
//!
//! `EventideDb` bundles the stores, queue, model registry, pipeline, poll
//! loop and waiters behind the public dispatch/wait surface.
//!
//! # Quick Start
//!
//! ```no_run
//! use eventide::prelude::*;
//! use eventide::model::{Applier, ModelDef, ModelTable, ModelView, Reducer, Reduction};
//! use serde_json::{json, Value};
//!
//! struct Items;
//!
//! impl Reducer for Items {
//!     fn reduce(&self, _model: &ModelView<'_>, event: &Event) -> Result<Reduction> {
//!         Ok(Reduction::changes(json!({ "id": event.data["id"], "v": event.v })))
//!     }
//! }
//!
//! impl Applier for Items {
//!     fn apply(&self, model: &ModelTable<'_>, changes: &Value) -> Result<()> {
//!         model.execute(
//!             "INSERT OR REPLACE INTO items (id, v) VALUES (?1, ?2)",
//!             rusqlite::params![changes["id"].as_str(), changes["v"].as_u64()],
//!         )?;
//!         Ok(())
//!     }
//! }
//!
//! # async fn demo() -> Result<()> {
//! let db = EventideDb::open(
//!     EngineConfig::memory(),
//!     vec![ModelDef::new("items")
//!         .with_migration("init", |conn| {
//!             conn.execute("CREATE TABLE items (id TEXT PRIMARY KEY, v INTEGER)", [])
//!                 .map_err(|e| EventideError::Store(e.to_string()))?;
//!             Ok(())
//!         })
//!         .with_reducer(Items)
//!         .with_apply_changes(Items)],
//! )?;
//!
//! let event = db.dispatch("ADD", json!({"id": "a"})).await?;
//! assert_eq!(event.v, 1);
//! db.close().await?;
//! # Ok(())
//! # }
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use eventide_core::{EngineConfig, Event, EventideError, Result, Version};
use eventide_sqlite::{MigrationRunner, SqliteStore};

use crate::model::ModelDef;
use crate::observer::ObserverHub;
use crate::pipeline::EventPipeline;
use crate::poller::PollLoop;
use crate::queue::{queue_migration, EventQueue};
use crate::registry::ModelRegistry;
use crate::version::VersionTracker;
use crate::waiter::WaiterSet;

/// The event-sourced database engine.
///
/// Cloning is cheap and shares the underlying engine.
#[derive(Clone)]
pub struct EventideDb {
    inner: Arc<DbInner>,
}

struct DbInner {
    rw_store: SqliteStore,
    ro_store: SqliteStore,
    queue: EventQueue,
    registry: Arc<ModelRegistry>,
    version: Arc<VersionTracker>,
    waiters: Arc<WaiterSet>,
    observers: ObserverHub,
    poller: PollLoop,
    closed: AtomicBool,
}

impl EventideDb {
    /// Open the engine: validate the models, open the store handles with
    /// the models' migrations, and wire up the queue, pipeline and loop.
    ///
    /// Store aliasing follows the database location:
    /// - in-memory: one connection shared by everything (a second handle
    ///   would see an empty database)
    /// - file, no separate queue file: the queue shares the read-write
    ///   connection, a read-only handle serves snapshots
    /// - separate queue file: the queue gets its own store and migration
    pub fn open(config: EngineConfig, models: Vec<ModelDef>) -> Result<Self> {
        let (registry, model_migrations) = ModelRegistry::new(models)?;
        let registry = Arc::new(registry);
        let read_only = config.store.read_only;

        let queue_aliases_store = match &config.queue {
            None => true,
            Some(queue) => queue.path == config.store.path,
        };

        let mut rw_migrations = MigrationRunner::new();
        if !read_only {
            rw_migrations.add_all(model_migrations);
            if queue_aliases_store {
                rw_migrations.add(queue_migration());
            }
        }

        let rw_config = config.store.clone().with_name(format!("{}-rw", config.store.name));
        let rw_store = SqliteStore::open(rw_config, rw_migrations)?;

        let ro_store = if config.store.is_memory() || read_only {
            rw_store.clone()
        } else {
            let ro_config = config
                .store
                .clone()
                .with_read_only(true)
                .with_name(format!("{}-ro", config.store.name));
            SqliteStore::open(ro_config, MigrationRunner::new())?
        };

        let queue_store = if queue_aliases_store {
            rw_store.clone()
        } else {
            let queue_config = config
                .queue
                .clone()
                .expect("separate queue implies a queue config")
                .with_read_only(read_only)
                .with_name(format!("{}-queue", config.store.name));
            let mut queue_migrations = MigrationRunner::new();
            if !read_only {
                queue_migrations.add(queue_migration());
            }
            SqliteStore::open(queue_config, queue_migrations)?
        };

        let queue = EventQueue::new(queue_store, config.poll_interval());
        let version = Arc::new(VersionTracker::new(ro_store.clone()));
        let waiters = Arc::new(WaiterSet::new());
        let observers = ObserverHub::new();
        let pipeline = EventPipeline::new(registry.clone(), rw_store.clone(), ro_store.clone());

        let poller = PollLoop::new(
            queue.clone(),
            rw_store.clone(),
            ro_store.clone(),
            version.clone(),
            pipeline,
            waiters.clone(),
            observers.clone(),
            config.poll_interval(),
            config.retry_backoff(),
            config.max_retries,
            config.stop_on_error,
            read_only,
        );

        tracing::info!(
            models = registry.len(),
            read_only,
            "opened eventide engine"
        );

        Ok(Self {
            inner: Arc::new(DbInner {
                rw_store,
                ro_store,
                queue,
                registry,
                version,
                waiters,
                observers,
                poller,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Append an event and wait for it to be durably processed.
    ///
    /// Resolves with the processed event record once the version advanced
    /// past it; rejects with [`EventideError::EventFailed`] when processing
    /// committed an error.
    pub async fn dispatch(&self, event_type: &str, data: impl Serialize) -> Result<Event> {
        self.dispatch_with_ts(event_type, data, None).await
    }

    /// Like [`dispatch`](Self::dispatch) with an explicit enqueue
    /// timestamp (wall-clock seconds).
    pub async fn dispatch_with_ts(
        &self,
        event_type: &str,
        data: impl Serialize,
        ts: Option<i64>,
    ) -> Result<Event> {
        self.check_open()?;
        let data = serde_json::to_value(data)
            .map_err(|e| EventideError::Serialization(e.to_string()))?;
        let event = self.inner.queue.add(event_type, data, ts)?;
        self.handled_version(event.v).await
    }

    /// Wait until version `v` has been processed and return its event.
    pub async fn handled_version(&self, v: Version) -> Result<Event> {
        if v == 0 {
            return Err(EventideError::InvalidEvent(
                "versions are numbered from 1".into(),
            ));
        }
        self.check_open()?;
        if let Some(gave_up) = self.inner.poller.fatal_version() {
            if v >= gave_up {
                return Err(EventideError::GaveUp(gave_up));
            }
        }

        let current = self.inner.version.get().await?;
        if v <= current {
            return self.stored_event(v);
        }

        // register before starting the loop; the pass-end sweep covers the
        // window between the version check and registration
        let waiter = self.inner.waiters.register(v);
        self.inner.poller.ensure_running(Some(v));
        if let Some(gave_up) = self.inner.poller.fatal_version() {
            if v >= gave_up {
                return Err(EventideError::GaveUp(gave_up));
            }
        }
        if self.inner.poller.is_stopped() {
            return Err(EventideError::Closed);
        }
        waiter.wait().await
    }

    /// Wait until everything currently in the queue has been processed.
    /// Resolves with the last queued event, or `None` on an empty queue.
    pub async fn wait_for_queue(&self) -> Result<Option<Event>> {
        self.check_open()?;
        let latest = self.inner.queue.latest_version()?;
        if latest == 0 {
            return Ok(None);
        }
        self.handled_version(latest).await.map(Some)
    }

    /// The persisted version: the highest successfully applied event.
    pub async fn current_version(&self) -> Result<Version> {
        self.inner.version.get().await
    }

    /// Keep the poll loop running continuously instead of letting it exit
    /// when the queue drains. Picks up events enqueued by other processes.
    pub fn start_polling(&self) {
        self.inner.poller.set_polling(true);
    }

    /// Ask the loop to stop and wait for the current pass to finish.
    /// Advisory: the in-flight event completes, mid-event cancellation is
    /// not supported.
    pub async fn stop_polling(&self) {
        self.inner.poller.stop().await;
    }

    /// Stop the loop, fail outstanding waiters and close the store handles.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.poller.stop().await;
        self.inner.waiters.fail_all();
        self.inner.queue.wake();
        self.inner.queue.close();
        self.inner.ro_store.close();
        self.inner.rw_store.close();
        tracing::info!("closed eventide engine");
        Ok(())
    }

    /// The event queue (also usable for admin rewrites of failed rows).
    pub fn queue(&self) -> &EventQueue {
        &self.inner.queue
    }

    /// Read handle onto the database holding the model tables.
    pub fn store(&self) -> &SqliteStore {
        &self.inner.ro_store
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    /// Successfully processed events, in commit order.
    pub fn on_result(&self) -> broadcast::Receiver<Event> {
        self.inner.observers.on_result()
    }

    /// Events that committed with an error map.
    pub fn on_error(&self) -> broadcast::Receiver<Event> {
        self.inner.observers.on_error()
    }

    /// Every processed event, success or failure, in commit order.
    pub fn on_handled(&self) -> broadcast::Receiver<Event> {
        self.inner.observers.on_handled()
    }

    fn stored_event(&self, v: Version) -> Result<Event> {
        let event = self
            .inner
            .queue
            .get(v)?
            .ok_or_else(|| EventideError::NotFound(format!("event {v}")))?;
        if event.is_error() {
            Err(EventideError::EventFailed(Box::new(event)))
        } else {
            Ok(event)
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(EventideError::Closed);
        }
        Ok(())
    }
}
