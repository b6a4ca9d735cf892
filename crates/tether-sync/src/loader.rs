//! Load context and deferred resolution handles.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tether_core::{Endpoint, PointerId};
use tether_reactive::{Pointer, PointerSpace};

/// Context threaded through one logical load operation, including any
/// nested loads triggered while materializing referenced pointers.
///
/// It carries the endpoint the triggering message came from (used as a
/// last-resort value source) and the set of pointer ids already being
/// resolved, which breaks forward-reference cycles.
#[derive(Clone, Default)]
pub struct LoadContext {
    sender: Option<Endpoint>,
    in_flight: Arc<Mutex<HashSet<PointerId>>>,
}

impl LoadContext {
    pub fn new() -> LoadContext {
        LoadContext::default()
    }

    pub fn with_sender(endpoint: Endpoint) -> LoadContext {
        LoadContext {
            sender: Some(endpoint),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn sender(&self) -> Option<Endpoint> {
        self.sender.clone()
    }

    pub fn is_loading(&self, id: &PointerId) -> bool {
        self.in_flight.lock().contains(id)
    }

    /// Marks an id as being resolved in this context. Decoders that
    /// materialize nested references call this around each pointer they
    /// expand so inner loads of the same id defer instead of deadlock.
    pub fn begin(&self, id: PointerId) {
        self.in_flight.lock().insert(id);
    }

    pub fn finish(&self, id: &PointerId) {
        self.in_flight.lock().remove(id);
    }
}

/// Placeholder handed out when a load hits a pointer that is already
/// being resolved higher up the same load. Resolve it after the outer
/// load completes.
#[derive(Clone)]
pub struct LazyPointer {
    id: PointerId,
    space: PointerSpace,
}

impl LazyPointer {
    pub(crate) fn new(id: PointerId, space: PointerSpace) -> LazyPointer {
        LazyPointer { id, space }
    }

    pub fn id(&self) -> PointerId {
        self.id
    }

    /// The real pointer, once the outer load has registered it.
    pub fn resolve(&self) -> Option<Pointer> {
        self.space.get(&self.id)
    }
}

/// Result of a load: either the pointer itself, or a deferred handle
/// when the id is part of a reference cycle still being resolved.
pub enum LoadOutcome {
    Ready(Pointer),
    Deferred(LazyPointer),
}

impl std::fmt::Debug for LoadOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadOutcome::Ready(ptr) => f.debug_tuple("Ready").field(&ptr.id()).finish(),
            LoadOutcome::Deferred(lazy) => f.debug_tuple("Deferred").field(&lazy.id).finish(),
        }
    }
}

impl LoadOutcome {
    pub fn ready(self) -> Option<Pointer> {
        match self {
            LoadOutcome::Ready(ptr) => Some(ptr),
            LoadOutcome::Deferred(_) => None,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, LoadOutcome::Deferred(_))
    }
}
