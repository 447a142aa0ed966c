//! Per-run cache of fetched source objects for the apply-time mutator.

use std::sync::Mutex;

use rustc_hash::FxHashMap;
use serde_json::Value;

use rekon_core::ObjMeta;

/// Guarded map; the executor reads and writes it between object iterations,
/// so contention is nil.
#[derive(Debug, Default)]
pub struct ResourceCache {
    map: Mutex<FxHashMap<ObjMeta, Value>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ObjMeta) -> Option<Value> {
        self.map.lock().ok()?.get(id).cloned()
    }

    pub fn put(&self, id: ObjMeta, obj: Value) {
        if let Ok(mut map) = self.map.lock() {
            map.insert(id, obj);
        }
    }

    pub fn len(&self) -> usize {
        self.map.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
