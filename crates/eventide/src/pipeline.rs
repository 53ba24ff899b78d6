//! Per-event pipeline
//!
//! Runs preprocess → reduce → apply → derive for one event inside the write
//! transaction held by the poll loop, then recurses over the event's
//! sub-events under the same version. Errors never escape: they are
//! captured onto the event's error map under a phase-tagged key and the
//! caller rolls the `handle` savepoint back.
//!
//! Phase rules:
//! - preprocessors run strictly in registration order and must not change
//!   `v` or empty the event type
//! - reducers see the read-only snapshot; every reducer runs and every
//!   failure is collected before the phase reports
//! - appliers and derivers run with the models writable; peers complete
//!   even after a failure, the first error wins the `_apply-<phase>` tag
//! - the version is persisted after appliers and before derivers, and only
//!   for the top-level event

use serde_json::Value;
use std::sync::Arc;

use eventide_core::{ErrorMap, Event, ResultMap};
use eventide_sqlite::{SqliteStore, StoreTxn};

use crate::model::{DeriveContext, ModelTable, ModelView};
use crate::registry::ModelRegistry;

/// Sub-events may nest this deep before the event fails with `_handle`.
pub const MAX_EVENT_DEPTH: usize = 100;

const RECURSION_ERROR: &str = "events recursing too deep";

pub struct EventPipeline {
    registry: Arc<ModelRegistry>,
    rw_store: SqliteStore,
    ro_store: SqliteStore,
}

impl EventPipeline {
    pub fn new(registry: Arc<ModelRegistry>, rw_store: SqliteStore, ro_store: SqliteStore) -> Self {
        Self {
            registry,
            rw_store,
            ro_store,
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Process one event at the given recursion depth, filling in its
    /// `result` or `error` in place. Never returns an error itself.
    pub fn handle(&self, txn: &StoreTxn<'_>, event: &mut Event, depth: usize) {
        if depth > MAX_EVENT_DEPTH {
            event.set_error("_handle", RECURSION_ERROR);
            return;
        }

        if !self.preprocess(txn, event) {
            return;
        }
        if !self.reduce(txn, event) {
            return;
        }
        if !self.apply(txn, event, depth) {
            return;
        }

        // sub-events run strictly in order, under the parent's version
        let mut index = 0;
        while index < event.events.len() {
            let mut child = Event::from_sub(event.v, event.ts, &event.events[index]);
            self.handle(txn, &mut child, depth + 1);
            let failed = child.is_error();
            event.events[index].absorb(child);
            if failed {
                // the recursion-limit error surfaces verbatim at every level
                let too_deep = event.events[index]
                    .error
                    .as_ref()
                    .and_then(|e| e.get("_handle"))
                    .and_then(|v| v.as_str())
                    == Some(RECURSION_ERROR);
                if too_deep {
                    event.set_error("_handle", RECURSION_ERROR);
                } else {
                    event.set_error("_handle", format!("subevent {index} failed"));
                }
                return;
            }
            index += 1;
        }
    }

    /// Read-only view of a model. When the read store is the write store
    /// (in-memory databases), reads go through the open transaction;
    /// otherwise they see the pre-transaction snapshot.
    fn ro_view<'a>(&'a self, txn: &StoreTxn<'a>, name: &'a str) -> ModelView<'a> {
        if self.ro_store.same_store(&self.rw_store) {
            ModelView::from_txn(name, txn.conn())
        } else {
            ModelView::from_store(name, &self.ro_store)
        }
    }

    fn preprocess(&self, txn: &StoreTxn<'_>, event: &mut Event) -> bool {
        for model in self.registry.preprocessor_models() {
            let preprocessor = match &model.preprocessor {
                Some(p) => p,
                None => continue,
            };
            let view = self.ro_view(txn, &model.name);
            let v_before = event.v;

            let failure = match preprocessor.preprocess(&view, event) {
                Err(e) => Some(e.to_string()),
                Ok(()) if event.v != v_before => {
                    Some("preprocessor changed the event version".to_string())
                }
                Ok(()) if event.event_type.is_empty() => {
                    Some("preprocessor removed the event type".to_string())
                }
                Ok(()) => None,
            };

            if let Some(message) = failure {
                event.set_error(format!("_preprocess_{}", model.name), message);
                return false;
            }
        }
        true
    }

    fn reduce(&self, txn: &StoreTxn<'_>, event: &mut Event) -> bool {
        let mut result = ResultMap::new();
        let mut errors = ErrorMap::new();
        let mut sub_events = Vec::new();

        for model in self.registry.reducer_models() {
            let reducer = match &model.reducer {
                Some(r) => r,
                None => continue,
            };
            let view = self.ro_view(txn, &model.name);
            match reducer.reduce(&view, event) {
                Ok(reduction) => {
                    if let Some(changes) = reduction.changes {
                        result.insert(model.name.clone(), changes);
                    }
                    sub_events.extend(reduction.events);
                }
                Err(e) => {
                    errors.insert(
                        format!("reduce_{}", model.name),
                        Value::String(e.to_string()),
                    );
                }
            }
        }

        if !errors.is_empty() {
            event.result = None;
            event.error = Some(errors);
            return false;
        }

        event.events.extend(sub_events);
        event.result = Some(result);
        true
    }

    fn apply(&self, txn: &StoreTxn<'_>, event: &mut Event, depth: usize) -> bool {
        self.registry.set_writable(true);
        let mut failure: Option<(&'static str, String)> = None;

        if let Some(result) = &event.result {
            for (name, changes) in result {
                match self.registry.applier_model(name) {
                    Some(model) => {
                        let applier = match &model.applier {
                            Some(a) => a,
                            None => continue,
                        };
                        let table = ModelTable::new(&model.name, txn.conn(), &model.writable);
                        if let Err(e) = applier.apply(&table, changes) {
                            failure.get_or_insert(("apply", e.to_string()));
                        }
                    }
                    None => {
                        failure
                            .get_or_insert(("apply", format!("model '{name}' has no applyChanges")));
                    }
                }
            }
        }

        if depth == 0 && failure.is_none() {
            if let Err(e) = txn.set_user_version(event.v) {
                failure = Some(("version", e.to_string()));
            }
        }

        if failure.is_none() {
            let result = event.result.clone().unwrap_or_default();
            let mut sub_events = Vec::new();
            for model in self.registry.deriver_models() {
                let deriver = match &model.deriver {
                    Some(d) => d,
                    None => continue,
                };
                let table = ModelTable::new(&model.name, txn.conn(), &model.writable);
                let mut cx = DeriveContext::new(&table, event, &result, &mut sub_events);
                if let Err(e) = deriver.derive(&mut cx) {
                    failure.get_or_insert(("derive", e.to_string()));
                }
            }
            event.events.extend(sub_events);
        }

        self.registry.set_writable(false);

        if let Some((phase, message)) = failure {
            event.set_error(format!("_apply-{phase}"), message);
            false
        } else {
            true
        }
    }
}
