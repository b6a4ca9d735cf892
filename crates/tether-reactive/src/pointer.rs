//! Pointer state and handles.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tether_core::{Endpoint, Key, PointerId, Shape};

use crate::cell::{ValueCell, WeakValueCell};
use crate::observe::{ObserverId, ObserverSet};
use crate::transform::TransformSource;

/// Callback run when a pointer is deleted or collected.
pub type Disposer = Box<dyn FnOnce() + Send>;

/// How the registry holds a pointer's value.
pub(crate) enum ValueSlot {
    /// No value bound yet.
    Empty,
    Strong(ValueCell),
    /// Weakened by the collector during its grace window.
    Weak(WeakValueCell),
}

impl ValueSlot {
    pub(crate) fn cell(&self) -> Option<ValueCell> {
        match self {
            ValueSlot::Empty => None,
            ValueSlot::Strong(cell) => Some(cell.clone()),
            ValueSlot::Weak(weak) => weak.upgrade(),
        }
    }
}

/// Shared pointer state. One `PointerCore` exists per registered pointer;
/// user-facing [`Pointer`] handles are cheap clones of the `Arc`.
pub struct PointerCore {
    pub(crate) id: RwLock<PointerId>,
    pub(crate) origin: RwLock<Endpoint>,
    pub(crate) shape: RwLock<Shape>,
    pub(crate) slot: RwLock<ValueSlot>,
    pub(crate) observers: Mutex<ObserverSet>,
    pub(crate) transform: RwLock<Option<Arc<TransformSource>>>,
    pub(crate) subscribers: RwLock<HashSet<Endpoint>>,
    pub(crate) subscribed_to: RwLock<Option<Endpoint>>,
    pub(crate) allowed_access: RwLock<Option<HashSet<Endpoint>>>,
    pub(crate) disposers: Mutex<Vec<Disposer>>,
    /// Child pointers whose updates are republished on this pointer,
    /// with the observer registered on the child for teardown.
    pub(crate) child_watch: Mutex<Vec<(Key, PointerId, ObserverId)>>,
    pub(crate) observer_count: AtomicUsize,
    pub(crate) initialized: AtomicBool,
    pub(crate) anonymous: AtomicBool,
    pub(crate) placeholder: AtomicBool,
    pub(crate) persistent: AtomicBool,
    pub(crate) sealed: AtomicBool,
    pub(crate) collected: AtomicBool,
    pub(crate) created_in_context: AtomicBool,
    /// Re-entrancy guard: set while a mutation is applied and observers
    /// are notified.
    pub(crate) applying: AtomicBool,
}

impl PointerCore {
    pub(crate) fn new(id: PointerId, origin: Endpoint, shape: Shape) -> PointerCore {
        PointerCore {
            id: RwLock::new(id),
            origin: RwLock::new(origin),
            shape: RwLock::new(shape),
            slot: RwLock::new(ValueSlot::Empty),
            observers: Mutex::new(ObserverSet::default()),
            transform: RwLock::new(None),
            subscribers: RwLock::new(HashSet::new()),
            subscribed_to: RwLock::new(None),
            allowed_access: RwLock::new(None),
            disposers: Mutex::new(Vec::new()),
            child_watch: Mutex::new(Vec::new()),
            observer_count: AtomicUsize::new(0),
            initialized: AtomicBool::new(false),
            anonymous: AtomicBool::new(false),
            placeholder: AtomicBool::new(false),
            persistent: AtomicBool::new(false),
            sealed: AtomicBool::new(false),
            collected: AtomicBool::new(false),
            created_in_context: AtomicBool::new(true),
            applying: AtomicBool::new(false),
        }
    }

    /// Whether the pointer must survive garbage collection.
    pub(crate) fn retained(&self) -> bool {
        self.persistent.load(Ordering::SeqCst)
            || self.observer_count.load(Ordering::SeqCst) > 0
            || !self.subscribers.read().is_empty()
    }
}

/// User-facing handle to a pointer. Holding a handle does not by itself
/// retain the pointer; retention comes from persistence, subscribers or
/// observers.
#[derive(Clone)]
pub struct Pointer {
    pub(crate) core: Arc<PointerCore>,
}

impl Pointer {
    pub fn id(&self) -> PointerId {
        *self.core.id.read()
    }

    pub fn origin(&self) -> Endpoint {
        self.core.origin.read().clone()
    }

    pub fn shape(&self) -> Shape {
        self.core.shape.read().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.core.initialized.load(Ordering::SeqCst)
    }

    pub fn is_anonymous(&self) -> bool {
        self.core.anonymous.load(Ordering::SeqCst)
    }

    pub fn is_placeholder(&self) -> bool {
        self.core.placeholder.load(Ordering::SeqCst)
    }

    pub fn is_persistent(&self) -> bool {
        self.core.persistent.load(Ordering::SeqCst)
    }

    pub fn is_sealed(&self) -> bool {
        self.core.sealed.load(Ordering::SeqCst)
    }

    pub fn was_collected(&self) -> bool {
        self.core.collected.load(Ordering::SeqCst)
    }

    /// Whether this pointer was created by local code rather than
    /// materialized from a remote value.
    pub fn created_in_context(&self) -> bool {
        self.core.created_in_context.load(Ordering::SeqCst)
    }

    pub fn is_transform(&self) -> bool {
        self.core.transform.read().is_some()
    }

    pub fn observer_count(&self) -> usize {
        self.core.observer_count.load(Ordering::SeqCst)
    }

    pub fn subscribers(&self) -> Vec<Endpoint> {
        self.core.subscribers.read().iter().cloned().collect()
    }

    pub fn has_subscribers(&self) -> bool {
        !self.core.subscribers.read().is_empty()
    }

    /// The endpoint this pointer currently receives updates from, if any.
    pub fn subscribed_to(&self) -> Option<Endpoint> {
        self.core.subscribed_to.read().clone()
    }

    pub(crate) fn same_core(&self, other: &Pointer) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl fmt::Debug for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pointer")
            .field("id", &self.id())
            .field("origin", &self.origin())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Options for creating a pointer.
#[derive(Default)]
pub struct CreateOptions {
    /// Explicit id; allocated from the local endpoint when absent.
    pub id: Option<PointerId>,
    /// Origin endpoint; defaults to the space's local endpoint.
    pub origin: Option<Endpoint>,
    /// Exempt from garbage collection.
    pub persistent: bool,
    /// Anonymous pointers get the all-zero id and are never registered
    /// under an address.
    pub anonymous: bool,
    /// Reject all mutation after initialization.
    pub sealed: bool,
    /// Restrict read access to these endpoints.
    pub allowed_access: Option<HashSet<Endpoint>>,
    /// Declared shape; defaults to `Any`.
    pub shape: Shape,
}
