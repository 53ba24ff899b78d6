//! Schema migration runner
//!
//! Migrations are applied once per database, in registration order, before
//! the store hands out its first connection. Applied keys are tracked in a
//! `_migrations` table rather than `PRAGMA user_version` because the engine
//! claims `user_version` for the event version.

use rusqlite::Connection;
use std::collections::HashSet;

use eventide_core::{EventideError, Result};

/// A single schema migration.
///
/// Keys must be unique within a store. A migration runs exactly once per
/// database file; reopening the store re-checks the `_migrations` table and
/// skips anything already applied.
pub trait Migration: Send + Sync {
    /// Unique key recorded in the `_migrations` table.
    fn key(&self) -> &str;

    /// Apply the migration.
    fn up(&self, conn: &Connection) -> Result<()>;
}

impl std::fmt::Debug for dyn Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration").field("key", &self.key()).finish()
    }
}

/// A migration defined by a closure.
pub struct FnMigration<F> {
    key: String,
    up: F,
}

impl<F> FnMigration<F>
where
    F: Fn(&Connection) -> Result<()> + Send + Sync,
{
    pub fn new(key: impl Into<String>, up: F) -> Self {
        Self {
            key: key.into(),
            up,
        }
    }
}

impl<F> Migration for FnMigration<F>
where
    F: Fn(&Connection) -> Result<()> + Send + Sync,
{
    fn key(&self) -> &str {
        &self.key
    }

    fn up(&self, conn: &Connection) -> Result<()> {
        (self.up)(conn)
    }
}

/// Ordered collection of migrations for one store.
#[derive(Default)]
pub struct MigrationRunner {
    migrations: Vec<Box<dyn Migration>>,
}

impl MigrationRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a migration. Order of registration is order of application.
    pub fn add(&mut self, migration: Box<dyn Migration>) {
        self.migrations.push(migration);
    }

    pub fn add_all(&mut self, migrations: Vec<Box<dyn Migration>>) {
        for m in migrations {
            self.add(m);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Apply all unapplied migrations inside one transaction.
    pub fn run(&self, conn: &Connection) -> Result<()> {
        if self.migrations.is_empty() {
            return Ok(());
        }

        let mut seen = HashSet::new();
        for m in &self.migrations {
            if !seen.insert(m.key().to_string()) {
                return Err(EventideError::Config(format!(
                    "duplicate migration key '{}'",
                    m.key()
                )));
            }
        }

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                key TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )
        .map_err(|e| EventideError::Store(e.to_string()))?;

        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| EventideError::Store(e.to_string()))?;

        for migration in &self.migrations {
            let key = migration.key();
            let applied: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM _migrations WHERE key = ?1)",
                    [key],
                    |row| row.get(0),
                )
                .map_err(|e| EventideError::Store(e.to_string()))?;

            if applied {
                continue;
            }

            tracing::debug!(key, "applying migration");
            if let Err(e) = migration.up(conn) {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(EventideError::Migration(key.to_string(), e.to_string()));
            }

            conn.execute("INSERT INTO _migrations (key) VALUES (?1)", [key])
                .map_err(|e| {
                    let _ = conn.execute_batch("ROLLBACK");
                    EventideError::Store(e.to_string())
                })?;
        }

        conn.execute_batch("COMMIT")
            .map_err(|e| EventideError::Store(e.to_string()))?;

        Ok(())
    }
}
