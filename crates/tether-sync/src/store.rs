//! Local pointer persistence, the first stop of the load chain.

use std::collections::HashMap;

use parking_lot::RwLock;
use tether_core::{PointerId, Value};

/// Backing store consulted before any network source when a pointer is
/// loaded, and written through when pointer state should survive the
/// process.
pub trait PointerStore: Send + Sync {
    fn get_pointer_value(&self, id: &PointerId) -> Option<Value>;
    fn set_pointer(&self, id: &PointerId, value: &Value);
    fn has_pointer(&self, id: &PointerId) -> bool;
    fn remove_pointer(&self, id: &PointerId);
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<PointerId, Value>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl PointerStore for MemoryStore {
    fn get_pointer_value(&self, id: &PointerId) -> Option<Value> {
        self.entries.read().get(id).cloned()
    }

    fn set_pointer(&self, id: &PointerId, value: &Value) {
        self.entries.write().insert(*id, value.clone());
    }

    fn has_pointer(&self, id: &PointerId) -> bool {
        self.entries.read().contains_key(id)
    }

    fn remove_pointer(&self, id: &PointerId) {
        self.entries.write().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        let id = PointerId::ANONYMOUS;
        assert!(!store.has_pointer(&id));
        store.set_pointer(&id, &Value::Int(3));
        assert_eq!(store.get_pointer_value(&id), Some(Value::Int(3)));
        store.remove_pointer(&id);
        assert!(store.is_empty());
    }
}
