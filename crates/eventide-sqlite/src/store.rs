//! SQLite store handle
//!
//! Wraps a single `rusqlite::Connection` behind a mutex. The connection is
//! opened lazily and can be closed at any time; the next operation reopens
//! it, which is what the engine's retry path relies on to recover from
//! transient store errors.

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, Params, Row};
use std::path::Path;
use std::sync::Arc;

use eventide_core::{EventideError, Result, StoreConfig, SynchronousMode};

use crate::migration::MigrationRunner;

fn store_err(e: rusqlite::Error) -> EventideError {
    EventideError::Store(e.to_string())
}

/// A SQLite database handle.
///
/// Cloning is cheap and shares the underlying connection; the engine uses
/// this to alias the queue store onto the read-write store when both live
/// in the same file.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    config: StoreConfig,
    migrations: MigrationRunner,
    conn: Mutex<Option<Connection>>,
}

impl SqliteStore {
    /// Open a store, applying `migrations` before first use.
    pub fn open(config: StoreConfig, migrations: MigrationRunner) -> Result<Self> {
        if config.read_only && config.is_memory() {
            return Err(EventideError::Config(
                "a read-only in-memory store can never contain data".into(),
            ));
        }
        if config.read_only && !migrations.is_empty() {
            return Err(EventideError::Config(
                "migrations cannot run on a read-only store".into(),
            ));
        }

        let store = Self {
            inner: Arc::new(StoreInner {
                config,
                migrations,
                conn: Mutex::new(None),
            }),
        };

        // Connect eagerly so configuration and migration errors surface at
        // open time rather than on the first query.
        store.with_conn(|_| Ok(()))?;
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn is_memory(&self) -> bool {
        self.inner.config.is_memory()
    }

    pub fn read_only(&self) -> bool {
        self.inner.config.read_only
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.config.path.as_deref()
    }

    /// Whether two handles share one connection.
    pub fn same_store(&self, other: &SqliteStore) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether two handles point at the same database file.
    pub fn same_file(&self, other: &SqliteStore) -> bool {
        match (self.path(), other.path()) {
            (Some(a), Some(b)) => a == b,
            _ => self.same_store(other),
        }
    }

    /// Close the connection. File-backed stores reopen lazily on next use;
    /// for in-memory stores this is a no-op, since dropping the connection
    /// would drop the data with it.
    pub fn close(&self) {
        if self.is_memory() {
            return;
        }
        let mut guard = self.inner.conn.lock();
        if guard.take().is_some() {
            tracing::debug!(store = %self.inner.config.name, "closed connection");
        }
    }

    /// Run `f` with the (lazily opened) connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.inner.conn.lock();
        if guard.is_none() {
            *guard = Some(self.inner.open_connection()?);
        }
        f(guard.as_ref().expect("connection just opened"))
    }

    /// Execute a parameterized statement, returning the changed-row count.
    pub fn run<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        self.with_conn(|conn| conn.execute(sql, params).map_err(store_err))
    }

    /// Fetch a single row, or `None` when the query matches nothing.
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Option<T>>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_conn(|conn| query_row_on(conn, sql, params, f))
    }

    /// Fetch all matching rows.
    pub fn query_all<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_conn(|conn| query_all_on(conn, sql, params, f))
    }

    /// Stream rows through a callback.
    pub fn each<P, F>(&self, sql: &str, params: P, f: F) -> Result<()>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> Result<()>,
    {
        self.with_conn(|conn| each_on(conn, sql, params, f))
    }

    /// Read the persistent `PRAGMA user_version`.
    pub fn user_version(&self) -> Result<u64> {
        self.with_conn(user_version_on)
    }

    /// Run `f` inside a write transaction. Commits on `Ok`, rolls back on
    /// `Err`. The transaction object also exposes named savepoints for
    /// partial rollback.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&StoreTxn<'_>) -> Result<T>) -> Result<T> {
        if self.read_only() {
            return Err(EventideError::InvalidState(format!(
                "store '{}' is read-only",
                self.inner.config.name
            )));
        }

        self.with_conn(|conn| {
            conn.execute_batch("BEGIN IMMEDIATE").map_err(store_err)?;
            let txn = StoreTxn { conn };
            match f(&txn) {
                Ok(value) => {
                    conn.execute_batch("COMMIT").map_err(|e| {
                        let _ = conn.execute_batch("ROLLBACK");
                        store_err(e)
                    })?;
                    Ok(value)
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(e)
                }
            }
        })
    }
}

impl StoreInner {
    fn open_connection(&self) -> Result<Connection> {
        let conn = match &self.config.path {
            None => Connection::open_in_memory().map_err(store_err)?,
            Some(path) => {
                let flags = if self.config.read_only {
                    OpenFlags::SQLITE_OPEN_READ_ONLY
                } else {
                    OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
                };
                Connection::open_with_flags(path, flags).map_err(store_err)?
            }
        };

        self.configure_connection(&conn)?;

        if !self.config.read_only {
            self.migrations.run(&conn)?;
        }

        tracing::debug!(store = %self.config.name, "opened connection");
        Ok(conn)
    }

    fn configure_connection(&self, conn: &Connection) -> Result<()> {
        if self.config.wal_mode && !self.config.is_memory() && !self.config.read_only {
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(|e| EventideError::Config(e.to_string()))?;
        }

        let sync_mode = match self.config.synchronous {
            SynchronousMode::Full => "FULL",
            SynchronousMode::Normal => "NORMAL",
            SynchronousMode::Off => "OFF",
        };
        conn.pragma_update(None, "synchronous", sync_mode)
            .map_err(|e| EventideError::Config(e.to_string()))?;

        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| EventideError::Config(e.to_string()))?;

        Ok(())
    }
}

/// An open write transaction.
///
/// Mirrors the store's query surface on the transaction connection and adds
/// named, nestable savepoints plus `user_version` writes.
pub struct StoreTxn<'a> {
    conn: &'a Connection,
}

impl<'a> StoreTxn<'a> {
    /// The raw transaction connection, for callers that bind their own
    /// handles onto it.
    pub fn conn(&self) -> &'a Connection {
        self.conn
    }

    pub fn run<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        self.conn.execute(sql, params).map_err(store_err)
    }

    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Option<T>>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        query_row_on(self.conn, sql, params, f)
    }

    pub fn query_all<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        query_all_on(self.conn, sql, params, f)
    }

    pub fn each<P, F>(&self, sql: &str, params: P, f: F) -> Result<()>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> Result<()>,
    {
        each_on(self.conn, sql, params, f)
    }

    pub fn user_version(&self) -> Result<u64> {
        user_version_on(self.conn)
    }

    pub fn set_user_version(&self, version: u64) -> Result<()> {
        self.conn
            .pragma_update(None, "user_version", version as i64)
            .map_err(store_err)
    }

    pub fn savepoint(&self, name: &str) -> Result<()> {
        self.savepoint_command("SAVEPOINT", name)
    }

    pub fn release_savepoint(&self, name: &str) -> Result<()> {
        self.savepoint_command("RELEASE SAVEPOINT", name)
    }

    pub fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        self.savepoint_command("ROLLBACK TO SAVEPOINT", name)
    }

    fn savepoint_command(&self, command: &str, name: &str) -> Result<()> {
        // Savepoint names cannot be bound as parameters.
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(EventideError::InvalidState(format!(
                "invalid savepoint name '{name}'"
            )));
        }
        self.conn
            .execute_batch(&format!("{command} {name}"))
            .map_err(store_err)
    }
}

fn query_row_on<T, P, F>(conn: &Connection, sql: &str, params: P, f: F) -> Result<Option<T>>
where
    P: Params,
    F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
{
    use rusqlite::OptionalExtension;
    conn.query_row(sql, params, f).optional().map_err(store_err)
}

fn query_all_on<T, P, F>(conn: &Connection, sql: &str, params: P, mut f: F) -> Result<Vec<T>>
where
    P: Params,
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn.prepare(sql).map_err(store_err)?;
    let rows = stmt.query_map(params, |row| f(row)).map_err(store_err)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(store_err)?);
    }
    Ok(out)
}

fn each_on<P, F>(conn: &Connection, sql: &str, params: P, mut f: F) -> Result<()>
where
    P: Params,
    F: FnMut(&Row<'_>) -> Result<()>,
{
    let mut stmt = conn.prepare(sql).map_err(store_err)?;
    let mut rows = stmt.query(params).map_err(store_err)?;
    while let Some(row) = rows.next().map_err(store_err)? {
        f(row)?;
    }
    Ok(())
}

fn user_version_on(conn: &Connection) -> Result<u64> {
    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(store_err)?;
    Ok(version as u64)
}
