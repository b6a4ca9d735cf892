//! Identity map from pointer ids and value cells to pointer state.

use std::collections::HashMap;
use std::sync::Arc;

use tether_core::{PointerError, PointerId};

use crate::cell::CellId;
use crate::pointer::PointerCore;

/// Registry of all live pointers in one space.
///
/// `by_cell` is the identity index: binding a cell that is already bound
/// to a different pointer is a [`PointerError::DuplicateBinding`], which
/// guarantees at most one pointer per value.
#[derive(Default)]
pub(crate) struct PointerRegistry {
    by_id: HashMap<PointerId, Arc<PointerCore>>,
    by_cell: HashMap<CellId, PointerId>,
    labels: HashMap<String, PointerId>,
}

impl PointerRegistry {
    pub fn insert(&mut self, id: PointerId, core: Arc<PointerCore>) {
        self.by_id.insert(id, core);
    }

    pub fn get(&self, id: &PointerId) -> Option<Arc<PointerCore>> {
        self.by_id.get(id).cloned()
    }

    pub fn contains(&self, id: &PointerId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn remove(&mut self, id: &PointerId) -> Option<Arc<PointerCore>> {
        let core = self.by_id.remove(id)?;
        self.labels.retain(|_, target| target != id);
        Some(core)
    }

    /// Re-keys a placeholder that was assigned its final id.
    pub fn rekey(&mut self, from: &PointerId, to: PointerId) {
        if let Some(core) = self.by_id.remove(from) {
            self.by_id.insert(to, core);
        }
        for target in self.labels.values_mut() {
            if target == from {
                *target = to;
            }
        }
        for target in self.by_cell.values_mut() {
            if target == from {
                *target = to;
            }
        }
    }

    pub fn bind_cell(&mut self, cell: CellId, id: PointerId) -> Result<(), PointerError> {
        match self.by_cell.get(&cell) {
            Some(existing) if *existing != id => {
                Err(PointerError::DuplicateBinding(existing.to_string()))
            }
            _ => {
                self.by_cell.insert(cell, id);
                Ok(())
            }
        }
    }

    pub fn pointer_for_cell(&self, cell: &CellId) -> Option<PointerId> {
        self.by_cell.get(cell).copied()
    }

    pub fn unbind_cell(&mut self, cell: &CellId) {
        self.by_cell.remove(cell);
    }

    pub fn set_label(&mut self, label: &str, id: PointerId) {
        self.labels.insert(label.to_string(), id);
    }

    pub fn by_label(&self, label: &str) -> Option<PointerId> {
        self.labels.get(label).copied()
    }

    pub fn ids(&self) -> Vec<PointerId> {
        self.by_id.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }
}
