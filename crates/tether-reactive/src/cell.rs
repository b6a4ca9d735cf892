//! Shared value cells.
//!
//! A cell is the unit of value identity: two pointers are the same
//! pointer exactly when they are bound to the same cell. The id is
//! stable for the life of the cell and survives weakening, which lets
//! the registry keep its value-to-pointer index while the collector
//! holds only weak references.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tether_core::Value;

static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a value cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellId(u64);

/// Strong handle to a shared value.
#[derive(Clone)]
pub struct ValueCell {
    id: CellId,
    inner: Arc<RwLock<Value>>,
}

impl ValueCell {
    pub fn new(value: Value) -> ValueCell {
        ValueCell {
            id: CellId(NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed)),
            inner: Arc::new(RwLock::new(value)),
        }
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    pub fn get(&self) -> Value {
        self.inner.read().clone()
    }

    pub fn set(&self, value: Value) {
        *self.inner.write() = value;
    }

    pub fn with<R>(&self, f: impl FnOnce(&Value) -> R) -> R {
        f(&self.inner.read())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Value) -> R) -> R {
        f(&mut self.inner.write())
    }

    pub fn downgrade(&self) -> WeakValueCell {
        WeakValueCell {
            id: self.id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Number of strong handles, including the one held by the registry
    /// slot when the pointer has not been weakened.
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

/// Weak handle kept by the collector while a pointer is in its grace
/// window. Failing to upgrade means no live handle remains and the
/// value has been reclaimed.
#[derive(Clone)]
pub struct WeakValueCell {
    id: CellId,
    inner: Weak<RwLock<Value>>,
}

impl WeakValueCell {
    pub fn id(&self) -> CellId {
        self.id
    }

    pub fn upgrade(&self) -> Option<ValueCell> {
        self.inner.upgrade().map(|inner| ValueCell {
            id: self.id,
            inner,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_shares_value() {
        let cell = ValueCell::new(Value::Int(1));
        let other = cell.clone();
        other.set(Value::Int(2));
        assert_eq!(cell.get(), Value::Int(2));
        assert_eq!(cell.id(), other.id());
    }

    #[test]
    fn test_distinct_cells_distinct_ids() {
        assert_ne!(
            ValueCell::new(Value::Null).id(),
            ValueCell::new(Value::Null).id()
        );
    }

    #[test]
    fn test_weak_reclaim() {
        let cell = ValueCell::new(Value::Int(1));
        let weak = cell.downgrade();
        assert!(weak.upgrade().is_some());
        drop(cell);
        assert!(weak.upgrade().is_none());
    }
}
