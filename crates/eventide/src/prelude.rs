//! Eventide Prelude
//!
//! Import this to get all commonly used types and traits:
//!
//! ```
//! use eventide::prelude::*;
//! ```

// Core types
pub use crate::{
    EngineConfig, ErrorMap, Event, EventideDb, EventideError, Result, ResultMap, StoreConfig,
    SubEvent, Version,
};

// Models
pub use crate::{
    Applier, DeriveContext, Deriver, ModelDef, ModelTable, ModelView, Preprocessor, Reducer,
    Reduction,
};

// Store layer
pub use crate::{FnMigration, Migration, MigrationRunner, SqliteStore, StoreTxn};

// Re-export common external deps
pub use serde::{Deserialize, Serialize};
pub use serde_json::json;
pub use std::sync::Arc;
