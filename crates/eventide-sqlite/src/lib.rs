//! SQLite store layer for the eventide engine
//!
//! Provides the transactional store handle the engine consumes:
//! - Lazily (re)opened connections - close at any time, the next use reopens
//! - `with_transaction` with commit-or-rollback semantics
//! - Named, nestable savepoints for partial rollback inside a transaction
//! - `PRAGMA user_version` access for the engine's version protocol
//! - A key-ordered migration runner applied before first use

pub mod migration;
pub mod store;

pub use migration::{FnMigration, Migration, MigrationRunner};
pub use store::{SqliteStore, StoreTxn};
