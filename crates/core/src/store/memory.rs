//! In-memory store implementations.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::errors::StoreError;
use crate::models::NodeKey;

use super::{PropertyStore, TreeStore};

/// A tree store that keeps models in a map. Useful in tests and for
/// engines that do not need durability.
#[derive(Default)]
pub struct MemoryTreeStore<M> {
    nodes: Mutex<HashMap<String, M>>,
}

impl<M> MemoryTreeStore<M> {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
        }
    }
}

impl<Id: NodeKey, M: Clone + Send> TreeStore<Id, M> for MemoryTreeStore<M> {
    fn load_all(&self) -> Result<Vec<M>, StoreError> {
        Ok(self.nodes.lock().unwrap().values().cloned().collect())
    }

    fn insert(&self, id: Id, model: &M) -> Result<(), StoreError> {
        self.nodes
            .lock()
            .unwrap()
            .insert(id.to_string(), model.clone());
        Ok(())
    }

    fn update(&self, id: Id, model: &M) -> Result<(), StoreError> {
        self.nodes
            .lock()
            .unwrap()
            .insert(id.to_string(), model.clone());
        Ok(())
    }

    fn delete(&self, id: Id) -> Result<(), StoreError> {
        self.nodes.lock().unwrap().remove(&id.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.nodes.lock().unwrap().clear();
        Ok(())
    }
}

/// A property store backed by a map.
#[derive(Default)]
pub struct MemoryPropertyStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryPropertyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PropertyStore for MemoryPropertyStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
