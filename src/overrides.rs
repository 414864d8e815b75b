//! Host-controlled local overrides, layered on top of every snapshot.
use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};

use crate::snapshot::JsonObject;

/// All overrides currently set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Overrides {
    pub gates: HashMap<String, bool>,
    pub configs: HashMap<String, JsonObject>,
    pub layers: HashMap<String, JsonObject>,
}

/// Overrides live for the lifetime of the process and are never persisted or merged into a
/// snapshot.
#[derive(Debug, Default)]
pub struct OverrideStore {
    overrides: RwLock<Overrides>,
}

impl OverrideStore {
    pub fn new() -> OverrideStore {
        OverrideStore::default()
    }

    pub fn override_gate(&self, name: impl Into<String>, value: bool) {
        self.write().gates.insert(name.into(), value);
    }

    pub fn override_config(&self, name: impl Into<String>, value: JsonObject) {
        self.write().configs.insert(name.into(), value);
    }

    pub fn override_layer(&self, name: impl Into<String>, value: JsonObject) {
        self.write().layers.insert(name.into(), value);
    }

    /// Remove the override for `name`, or all gate overrides if `name` is `None`.
    pub fn remove_gate_override(&self, name: Option<&str>) {
        remove(&mut self.write().gates, name);
    }

    /// Remove the override for `name`, or all config overrides if `name` is `None`.
    pub fn remove_config_override(&self, name: Option<&str>) {
        remove(&mut self.write().configs, name);
    }

    /// Remove the override for `name`, or all layer overrides if `name` is `None`.
    pub fn remove_layer_override(&self, name: Option<&str>) {
        remove(&mut self.write().layers, name);
    }

    pub fn get_all(&self) -> Overrides {
        self.read().clone()
    }

    pub fn gate(&self, name: &str) -> Option<bool> {
        self.read().gates.get(name).copied()
    }

    pub fn config(&self, name: &str) -> Option<JsonObject> {
        self.read().configs.get(name).cloned()
    }

    pub fn layer(&self, name: &str) -> Option<JsonObject> {
        self.read().layers.get(name).cloned()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Overrides> {
        self.overrides.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Overrides> {
        self.overrides.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn remove<V>(map: &mut HashMap<String, V>, name: Option<&str>) {
    match name {
        Some(name) => {
            map.remove(name);
        }
        None => map.clear(),
    }
}
