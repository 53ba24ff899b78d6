//! Eventide: an event-sourced database engine on SQLite
//!
//! All state changes are expressed as ordered, persisted events; model
//! tables are rebuilt deterministically by replaying the event log through
//! user-defined reducers and derivers.
//!
//! - **Event queue**: append-only log keyed by a dense, strictly increasing
//!   version
//! - **Models**: user-defined preprocessors, reducers, appliers and
//!   derivers over tables in the store
//! - **Pipeline**: preprocess → reduce → apply → derive per event, inside
//!   one write transaction, with sub-event recursion
//! - **Poll loop**: single-flight drain with bounded retry, exponential
//!   backoff and connection reset
//! - **Waiters**: futures resolved when a given version becomes visible,
//!   including versions committed by other processes on the same file
//!
//! See [`EventideDb`] for the entry point and `eventide::prelude` for the
//! common imports.

pub mod db;
pub mod model;
pub mod observer;
pub mod pipeline;
pub mod prelude;
pub mod queue;
pub mod registry;
pub mod version;
pub mod waiter;

mod poller;

// Re-export core types
pub use eventide_core::{
    config::{EngineConfig, StoreConfig, SynchronousMode},
    error::{EventideError, Result},
    types::{ErrorMap, Event, ResultMap, SubEvent, Version},
};

// Re-export the store layer
pub use eventide_sqlite::{FnMigration, Migration, MigrationRunner, SqliteStore, StoreTxn};

// Re-export main types from this crate
pub use db::EventideDb;
pub use model::{
    Applier, DeriveContext, Deriver, ModelDef, ModelTable, ModelView, Preprocessor, Reducer,
    Reduction,
};
pub use observer::ObserverHub;
pub use pipeline::{EventPipeline, MAX_EVENT_DEPTH};
pub use queue::EventQueue;
pub use registry::{ModelRegistry, RESERVED_MODEL_NAME};
pub use version::VersionTracker;
pub use waiter::{WaiterHandle, WaiterSet};
