//! Keep-latest coalescing of outgoing updates.
//!
//! Updates queue per receiver endpoint. A later update for the same
//! (pointer, identifier) pair replaces the queued one, so rapid writes
//! to the same property collapse into the final state. Pointers marked
//! for intermediate updates opt out and keep every step in order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tether_core::{Endpoint, PointerId, UpdateOp};

use crate::message::PointerUpdate;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum QueueKey {
    /// Replaceable slot: later ops with the same key supersede.
    Coalesced(PointerId, String),
    /// Strictly ordered slot.
    Ordered(u64),
}

#[derive(Default)]
pub struct UpdateScheduler {
    queues: Mutex<HashMap<Endpoint, IndexMap<QueueKey, PointerUpdate>>>,
    intermediate: Mutex<HashSet<PointerId>>,
    seq: AtomicU64,
}

impl UpdateScheduler {
    pub fn new() -> UpdateScheduler {
        UpdateScheduler::default()
    }

    /// Opts a pointer in or out of intermediate updates. Opted-in
    /// pointers never coalesce.
    pub fn set_intermediate_updates(&self, pointer: PointerId, enabled: bool) {
        let mut intermediate = self.intermediate.lock();
        if enabled {
            intermediate.insert(pointer);
        } else {
            intermediate.remove(&pointer);
        }
    }

    pub fn queue(&self, to: Endpoint, pointer: PointerId, op: UpdateOp) {
        let coalesce = if self.intermediate.lock().contains(&pointer) {
            None
        } else {
            op.coalesce_identifier()
        };
        let key = match coalesce {
            Some(identifier) => QueueKey::Coalesced(pointer, identifier),
            None => QueueKey::Ordered(self.seq.fetch_add(1, Ordering::Relaxed)),
        };
        self.queues
            .lock()
            .entry(to)
            .or_default()
            .insert(key, PointerUpdate { pointer, op });
    }

    /// Takes everything queued, batched per receiver in queue order.
    pub fn flush(&self) -> Vec<(Endpoint, Vec<PointerUpdate>)> {
        self.queues
            .lock()
            .drain()
            .map(|(endpoint, queue)| {
                (
                    endpoint,
                    queue.into_iter().map(|(_, update)| update).collect(),
                )
            })
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.queues.lock().values().map(IndexMap::len).sum()
    }
}
