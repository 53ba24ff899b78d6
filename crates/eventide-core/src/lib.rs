//! Eventide Core: types, configuration and errors for the eventide engine
//!
//! This crate defines the shared abstractions of the event-sourced engine:
//! - Event records: ordered facts with version, payload, result and error maps
//! - Sub-events: events emitted during processing, sharing the parent's version
//! - Configuration for stores and the engine's polling/retry behavior
//! - The error taxonomy every crate in the workspace reports through
//!
//! No I/O happens here; the SQLite binding lives in `eventide-sqlite` and the
//! engine itself in `eventide`.

pub mod config;
pub mod error;
pub mod types;

pub use config::{EngineConfig, StoreConfig, SynchronousMode};
pub use error::{EventideError, Result};
pub use types::{ErrorMap, Event, ResultMap, SubEvent, Version};
