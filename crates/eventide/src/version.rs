//! Version tracking
//!
//! The engine's single monotonic version lives in the store's
//! `PRAGMA user_version`. Reads go through a cached single-flight future so
//! a burst of concurrent `get` calls costs one underlying read; writes only
//! ever happen inside the apply transaction, with `v = previous + 1`.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use eventide_core::{EventideError, Result, Version};
use eventide_sqlite::{SqliteStore, StoreTxn};

type SharedRead = Shared<BoxFuture<'static, std::result::Result<Version, String>>>;

/// Reads and advances the persisted version.
pub struct VersionTracker {
    store: SqliteStore,
    inflight: Mutex<Option<SharedRead>>,
}

impl VersionTracker {
    /// `store` should be the read handle; reads must never contend with the
    /// open write transaction.
    pub fn new(store: SqliteStore) -> Self {
        Self {
            store,
            inflight: Mutex::new(None),
        }
    }

    /// The persisted version. Concurrent calls coalesce into one read.
    pub async fn get(&self) -> Result<Version> {
        let (created, shared) = {
            let mut slot = self.inflight.lock();
            match slot.as_ref() {
                Some(shared) => (false, shared.clone()),
                None => {
                    let store = self.store.clone();
                    let shared = async move { store.user_version().map_err(|e| e.to_string()) }
                        .boxed()
                        .shared();
                    *slot = Some(shared.clone());
                    (true, shared)
                }
            }
        };

        let outcome = shared.await;
        if created {
            // only the initiating caller clears the cache, so a fresh
            // in-flight read started by a later caller survives
            *self.inflight.lock() = None;
        }
        outcome.map_err(EventideError::Store)
    }

    /// Advance the persisted version inside the apply transaction. Only the
    /// pipeline calls this, and only with `v = previous + 1`.
    pub fn set(&self, txn: &StoreTxn<'_>, v: Version) -> Result<()> {
        txn.set_user_version(v)
    }
}
