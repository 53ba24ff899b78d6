//! Model registry
//!
//! Validates model declarations at construction and splits their
//! capabilities into the lists the pipeline iterates: an ordered
//! preprocessor list, a reducer set and a deriver set, plus an applier
//! lookup by model name. Also owns the per-model writable flags the
//! pipeline toggles around the apply phase.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eventide_core::{EventideError, Result};
use eventide_sqlite::Migration;

use crate::model::{Applier, Deriver, ModelDef, Preprocessor, Reducer};

/// Reserved for the engine's own bookkeeping inside event results.
pub const RESERVED_MODEL_NAME: &str = "metadata";

pub(crate) struct RegisteredModel {
    pub(crate) name: String,
    pub(crate) preprocessor: Option<Arc<dyn Preprocessor>>,
    pub(crate) reducer: Option<Arc<dyn Reducer>>,
    pub(crate) applier: Option<Arc<dyn Applier>>,
    pub(crate) deriver: Option<Arc<dyn Deriver>>,
    pub(crate) writable: AtomicBool,
}

/// The set of models an engine instance was constructed with.
pub struct ModelRegistry {
    models: Vec<RegisteredModel>,
    preprocessors: Vec<usize>,
    reducers: Vec<usize>,
    derivers: Vec<usize>,
    appliers: HashMap<String, usize>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field(
                "models",
                &self.models.iter().map(|m| &m.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ModelRegistry {
    /// Validate the definitions and build the capability lists. Returns the
    /// registry together with the models' table migrations, which the engine
    /// applies to the read-write store before first use.
    pub fn new(defs: Vec<ModelDef>) -> Result<(Self, Vec<Box<dyn Migration>>)> {
        let mut models = Vec::with_capacity(defs.len());
        let mut preprocessors = Vec::new();
        let mut reducers = Vec::new();
        let mut derivers = Vec::new();
        let mut appliers = HashMap::new();
        let mut migrations = Vec::new();

        for def in defs {
            if def.name.is_empty() {
                return Err(EventideError::Config(
                    "model names must be non-empty".into(),
                ));
            }
            if def.name == RESERVED_MODEL_NAME {
                return Err(EventideError::Config(format!(
                    "model name '{RESERVED_MODEL_NAME}' is reserved"
                )));
            }
            if models.iter().any(|m: &RegisteredModel| m.name == def.name) {
                return Err(EventideError::Config(format!(
                    "duplicate model name '{}'",
                    def.name
                )));
            }
            if def.preprocessor.is_none() && def.reducer.is_none() && def.deriver.is_none() {
                return Err(EventideError::Config(format!(
                    "model '{}' declares no preprocessor, reducer or deriver",
                    def.name
                )));
            }
            if def.reducer.is_some() && def.applier.is_none() {
                return Err(EventideError::Config(format!(
                    "model '{}' declares a reducer but no applyChanges",
                    def.name
                )));
            }

            let index = models.len();
            if def.preprocessor.is_some() {
                preprocessors.push(index);
            }
            if def.reducer.is_some() {
                reducers.push(index);
            }
            if def.deriver.is_some() {
                derivers.push(index);
            }
            if def.applier.is_some() {
                appliers.insert(def.name.clone(), index);
            }
            migrations.extend(def.migrations);

            models.push(RegisteredModel {
                name: def.name,
                preprocessor: def.preprocessor,
                reducer: def.reducer,
                applier: def.applier,
                deriver: def.deriver,
                writable: AtomicBool::new(false),
            });
        }

        Ok((
            Self {
                models,
                preprocessors,
                reducers,
                derivers,
                appliers,
            },
            migrations,
        ))
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(|m| m.name.as_str())
    }

    /// Toggle the writable flag on every model. Called by the pipeline at
    /// the start and end of the apply phase; outside it, model writes fail.
    pub(crate) fn set_writable(&self, writable: bool) {
        for model in &self.models {
            model.writable.store(writable, Ordering::SeqCst);
        }
    }

    pub(crate) fn preprocessor_models(&self) -> impl Iterator<Item = &RegisteredModel> {
        self.preprocessors.iter().map(|&i| &self.models[i])
    }

    pub(crate) fn reducer_models(&self) -> impl Iterator<Item = &RegisteredModel> {
        self.reducers.iter().map(|&i| &self.models[i])
    }

    pub(crate) fn deriver_models(&self) -> impl Iterator<Item = &RegisteredModel> {
        self.derivers.iter().map(|&i| &self.models[i])
    }

    pub(crate) fn applier_model(&self, name: &str) -> Option<&RegisteredModel> {
        self.appliers.get(name).map(|&i| &self.models[i])
    }
}
