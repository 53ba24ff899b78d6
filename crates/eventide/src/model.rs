//! Model definitions and handles
//!
//! A model owns tables in the underlying store and declares up to four
//! capabilities, each run at a fixed point of the per-event pipeline:
//!
//! - **preprocessor**: canonicalizes the event before reduction; may emit
//!   sub-events
//! - **reducer**: pure function from the read-only snapshot and the event to
//!   a changes description for this model's tables
//! - **applyChanges**: writes a reducer's changes into the tables
//! - **deriver**: post-apply routine with write access (caches, indexes)
//!
//! Preprocessors and reducers only ever see a [`ModelView`], which has no
//! write methods; appliers and derivers get a [`ModelTable`] whose writes
//! are gated on the pipeline's writable flag.
//!
//! # Example
//!
//! ```no_run
//! use eventide::model::{Applier, ModelDef, ModelTable, ModelView, Reducer, Reduction};
//! use eventide::{Event, EventideError, Result};
//! use serde_json::{json, Value};
//!
//! struct BumpCount;
//!
//! impl Reducer for BumpCount {
//!     fn reduce(&self, _model: &ModelView<'_>, event: &Event) -> Result<Reduction> {
//!         Ok(Reduction::changes(json!({ "bump": event.data["id"] })))
//!     }
//! }
//!
//! impl Applier for BumpCount {
//!     fn apply(&self, model: &ModelTable<'_>, changes: &Value) -> Result<()> {
//!         model.execute(
//!             "INSERT INTO counts (id, n) VALUES (?1, 1)
//!              ON CONFLICT(id) DO UPDATE SET n = n + 1",
//!             [changes["bump"].as_str().unwrap_or_default()],
//!         )?;
//!         Ok(())
//!     }
//! }
//!
//! let counts = ModelDef::new("counts")
//!     .with_migration("init", |conn| {
//!         conn.execute(
//!             "CREATE TABLE counts (id TEXT PRIMARY KEY, n INTEGER NOT NULL)",
//!             [],
//!         )
//!         .map_err(|e| EventideError::Store(e.to_string()))?;
//!         Ok(())
//!     })
//!     .with_reducer(BumpCount)
//!     .with_apply_changes(BumpCount);
//! # let _ = counts;
//! ```

use rusqlite::{Connection, Params, Row};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eventide_core::{Event, EventideError, ResultMap, Result, SubEvent};
use eventide_sqlite::{FnMigration, Migration, SqliteStore};

fn store_err(e: rusqlite::Error) -> EventideError {
    EventideError::Store(e.to_string())
}

/// Canonicalizes an event before reducers see it.
///
/// May mutate the event in place (payload, type) and append sub-events via
/// [`Event::dispatch`], but must leave `v` untouched and the type non-empty.
pub trait Preprocessor: Send + Sync {
    fn preprocess(&self, model: &ModelView<'_>, event: &mut Event) -> Result<()>;
}

impl<F> Preprocessor for F
where
    F: Fn(&ModelView<'_>, &mut Event) -> Result<()> + Send + Sync,
{
    fn preprocess(&self, model: &ModelView<'_>, event: &mut Event) -> Result<()> {
        self(model, event)
    }
}

/// Pure function from `(snapshot, event)` to this model's table changes.
pub trait Reducer: Send + Sync {
    fn reduce(&self, model: &ModelView<'_>, event: &Event) -> Result<Reduction>;
}

impl<F> Reducer for F
where
    F: Fn(&ModelView<'_>, &Event) -> Result<Reduction> + Send + Sync,
{
    fn reduce(&self, model: &ModelView<'_>, event: &Event) -> Result<Reduction> {
        self(model, event)
    }
}

/// Writes a reducer's changes into the model's tables.
pub trait Applier: Send + Sync {
    fn apply(&self, model: &ModelTable<'_>, changes: &Value) -> Result<()>;
}

impl<F> Applier for F
where
    F: Fn(&ModelTable<'_>, &Value) -> Result<()> + Send + Sync,
{
    fn apply(&self, model: &ModelTable<'_>, changes: &Value) -> Result<()> {
        self(model, changes)
    }
}

/// Post-apply routine with write access to the model's tables.
pub trait Deriver: Send + Sync {
    fn derive(&self, cx: &mut DeriveContext<'_>) -> Result<()>;
}

impl<F> Deriver for F
where
    F: Fn(&mut DeriveContext<'_>) -> Result<()> + Send + Sync,
{
    fn derive(&self, cx: &mut DeriveContext<'_>) -> Result<()> {
        self(cx)
    }
}

/// Output of a reducer: an optional changes object plus any sub-events to
/// run within the parent's transaction.
#[derive(Debug, Default)]
pub struct Reduction {
    pub changes: Option<Value>,
    pub events: Vec<SubEvent>,
}

impl Reduction {
    /// No changes for this event.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn changes(changes: Value) -> Self {
        Self {
            changes: Some(changes),
            events: Vec::new(),
        }
    }

    pub fn with_event(mut self, event_type: impl Into<String>, data: Value) -> Self {
        self.events.push(SubEvent::new(event_type, data));
        self
    }
}

/// Declaration of a model: name, capabilities and table migrations.
///
/// A model must declare at least one of preprocessor/reducer/deriver, and an
/// `applyChanges` whenever it declares a reducer; the registry rejects
/// anything else at construction.
pub struct ModelDef {
    pub(crate) name: String,
    pub(crate) preprocessor: Option<Arc<dyn Preprocessor>>,
    pub(crate) reducer: Option<Arc<dyn Reducer>>,
    pub(crate) applier: Option<Arc<dyn Applier>>,
    pub(crate) deriver: Option<Arc<dyn Deriver>>,
    pub(crate) migrations: Vec<Box<dyn Migration>>,
}

impl ModelDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            preprocessor: None,
            reducer: None,
            applier: None,
            deriver: None,
            migrations: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_preprocessor(mut self, preprocessor: impl Preprocessor + 'static) -> Self {
        self.preprocessor = Some(Arc::new(preprocessor));
        self
    }

    pub fn with_reducer(mut self, reducer: impl Reducer + 'static) -> Self {
        self.reducer = Some(Arc::new(reducer));
        self
    }

    pub fn with_apply_changes(mut self, applier: impl Applier + 'static) -> Self {
        self.applier = Some(Arc::new(applier));
        self
    }

    pub fn with_deriver(mut self, deriver: impl Deriver + 'static) -> Self {
        self.deriver = Some(Arc::new(deriver));
        self
    }

    /// Register a migration creating or evolving this model's tables.
    /// Keys are namespaced by model name before they reach the store.
    pub fn with_migration<F>(mut self, key: impl Into<String>, up: F) -> Self
    where
        F: Fn(&Connection) -> Result<()> + Send + Sync + 'static,
    {
        let key = format!("{}/{}", self.name, key.into());
        self.migrations.push(Box::new(FnMigration::new(key, up)));
        self
    }
}

/// Where a model handle routes its SQL.
///
/// Inside the apply transaction handles borrow the open transaction's
/// connection; read-only views over a separate file lock that store's own
/// connection per call.
pub(crate) enum ConnRef<'a> {
    Txn(&'a Connection),
    Store(&'a SqliteStore),
}

impl<'a> ConnRef<'a> {
    fn with<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        match self {
            ConnRef::Txn(conn) => f(conn),
            ConnRef::Store(store) => store.with_conn(f),
        }
    }
}

/// Read-only view of a model, handed to preprocessors and reducers.
pub struct ModelView<'a> {
    name: &'a str,
    conn: ConnRef<'a>,
}

impl<'a> ModelView<'a> {
    pub(crate) fn from_txn(name: &'a str, conn: &'a Connection) -> Self {
        Self {
            name,
            conn: ConnRef::Txn(conn),
        }
    }

    pub(crate) fn from_store(name: &'a str, store: &'a SqliteStore) -> Self {
        Self {
            name,
            conn: ConnRef::Store(store),
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    /// Fetch a single row, or `None` when the query matches nothing.
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Option<T>>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        use rusqlite::OptionalExtension;
        self.conn
            .with(|conn| conn.query_row(sql, params, f).optional().map_err(store_err))
    }

    pub fn query_all<T, P, F>(&self, sql: &str, params: P, mut f: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.conn.with(|conn| {
            let mut stmt = conn.prepare(sql).map_err(store_err)?;
            let rows = stmt.query_map(params, |row| f(row)).map_err(store_err)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(store_err)?);
            }
            Ok(out)
        })
    }

    pub fn each<P, F>(&self, sql: &str, params: P, mut f: F) -> Result<()>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> Result<()>,
    {
        self.conn.with(|conn| {
            let mut stmt = conn.prepare(sql).map_err(store_err)?;
            let mut rows = stmt.query(params).map_err(store_err)?;
            while let Some(row) = rows.next().map_err(store_err)? {
                f(row)?;
            }
            Ok(())
        })
    }
}

/// Read-write handle onto a model's tables, bound to the open apply
/// transaction. Writes are only permitted while the pipeline holds the
/// model writable (during the apply and derive phases).
pub struct ModelTable<'a> {
    name: &'a str,
    conn: &'a Connection,
    writable: &'a AtomicBool,
}

impl<'a> ModelTable<'a> {
    pub(crate) fn new(name: &'a str, conn: &'a Connection, writable: &'a AtomicBool) -> Self {
        Self {
            name,
            conn,
            writable,
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    /// Execute a write statement. Fails with `NotWritable` outside the
    /// apply/derive phases.
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        if !self.is_writable() {
            return Err(EventideError::NotWritable(self.name.to_string()));
        }
        self.conn.execute(sql, params).map_err(store_err)
    }

    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Option<T>>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        use rusqlite::OptionalExtension;
        self.conn
            .query_row(sql, params, f)
            .optional()
            .map_err(store_err)
    }

    pub fn query_all<T, P, F>(&self, sql: &str, params: P, mut f: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn.prepare(sql).map_err(store_err)?;
        let rows = stmt.query_map(params, |row| f(row)).map_err(store_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(store_err)?);
        }
        Ok(out)
    }
}

/// Context handed to derivers: the writable model handle, the event, the
/// full reduce result, and a dispatcher for further sub-events.
pub struct DeriveContext<'a> {
    pub model: &'a ModelTable<'a>,
    pub event: &'a Event,
    pub result: &'a ResultMap,
    sub_events: &'a mut Vec<SubEvent>,
}

impl<'a> DeriveContext<'a> {
    pub(crate) fn new(
        model: &'a ModelTable<'a>,
        event: &'a Event,
        result: &'a ResultMap,
        sub_events: &'a mut Vec<SubEvent>,
    ) -> Self {
        Self {
            model,
            event,
            result,
            sub_events,
        }
    }

    /// Queue a sub-event to run within the current event's transaction.
    pub fn dispatch(&mut self, event_type: impl Into<String>, data: Value) {
        self.sub_events.push(SubEvent::new(event_type, data));
    }
}
