//! The pointer space: lifecycle, registration and retention.
//!
//! A `PointerSpace` owns every pointer of one endpoint process. All
//! lifecycle transitions (create, placeholder assignment, delete,
//! weaken, finalize) go through it, as do the mutation gateway and the
//! observer machinery layered on top in the sibling modules.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tether_core::{
    AddressTag, Endpoint, IdAllocator, Key, PointerError, PointerId, Update, UpdateOp, Value,
    POINTER_ID_LEN,
};
use tracing::debug;

use crate::cell::ValueCell;
use crate::observe::{ObserverFlow, ObserverId};
use crate::pointer::{CreateOptions, Disposer, Pointer, PointerCore, ValueSlot};
use crate::property::PropertyRefInner;
use crate::registry::PointerRegistry;

/// A mutation that passed the gateway and must be forwarded to remote
/// endpoints. Drained by the synchronizer.
#[derive(Debug, Clone)]
pub struct OutboundUpdate {
    pub pointer: PointerId,
    pub op: UpdateOp,
    /// Origin endpoint to report the change to, when this endpoint is
    /// not itself the origin.
    pub to_origin: Option<Endpoint>,
    /// Subscribers to forward the change to, minus the endpoint the
    /// change came from.
    pub subscribers: Vec<Endpoint>,
    pub is_transform: bool,
}

/// Where a mutation entered the gateway.
#[derive(Clone, PartialEq, Eq)]
pub(crate) enum UpdateSource {
    Local,
    Remote(Endpoint),
}

/// Snapshot of pointer metadata used by the collector.
#[derive(Debug, Clone)]
pub struct PointerMeta {
    pub id: PointerId,
    pub origin: Endpoint,
    pub subscribed_to: Option<Endpoint>,
    pub persistent: bool,
}

type AddedListener = Box<dyn Fn(&Pointer) + Send>;
type RemovedListener = Box<dyn Fn(PointerId) + Send>;

#[derive(Default)]
struct SpaceListeners {
    added: Vec<AddedListener>,
    removed: Vec<RemovedListener>,
}

pub struct SpaceConfig {
    pub local_endpoint: Endpoint,
    /// Address tag stamped into locally allocated ids.
    pub address_tag: AddressTag,
}

impl Default for SpaceConfig {
    fn default() -> SpaceConfig {
        SpaceConfig {
            local_endpoint: Endpoint::LOCAL,
            address_tag: AddressTag::Endpoint,
        }
    }
}

pub(crate) struct SpaceInner {
    pub(crate) registry: RwLock<PointerRegistry>,
    allocator: Mutex<IdAllocator>,
    local: RwLock<Endpoint>,
    outbound: Mutex<VecDeque<OutboundUpdate>>,
    /// Pointers whose retention inputs changed since the last collector
    /// tick.
    retention_events: Mutex<VecDeque<PointerId>>,
    listeners: Mutex<SpaceListeners>,
    /// Weak cache of property references, one per (pointer, key).
    pub(crate) property_refs: Mutex<HashMap<(PointerId, Key), Weak<PropertyRefInner>>>,
    /// Reverse subscriber index, endpoint to the pointers it subscribes
    /// to. Lets the synchronizer drop everything of an offline endpoint.
    subscriptions: Mutex<HashMap<Endpoint, HashSet<PointerId>>>,
}

/// Handle to a pointer space. Clones share the same space.
#[derive(Clone)]
pub struct PointerSpace {
    pub(crate) inner: Arc<SpaceInner>,
}

static NEXT_PROVISIONAL: AtomicU64 = AtomicU64::new(1);

/// Provisional ids are handed to placeholders and anonymous pointers.
/// Tag byte zero means they are never routable.
fn provisional_id() -> PointerId {
    let mut bytes = [0u8; POINTER_ID_LEN];
    let n = NEXT_PROVISIONAL.fetch_add(1, Ordering::Relaxed);
    bytes[POINTER_ID_LEN - 8..].copy_from_slice(&n.to_be_bytes());
    PointerId::from_bytes(bytes)
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl PointerSpace {
    pub fn new(local_endpoint: Endpoint) -> PointerSpace {
        PointerSpace::with_config(SpaceConfig {
            local_endpoint,
            ..Default::default()
        })
    }

    pub fn with_config(config: SpaceConfig) -> PointerSpace {
        let allocator = IdAllocator::new(config.address_tag, &config.local_endpoint);
        PointerSpace {
            inner: Arc::new(SpaceInner {
                registry: RwLock::new(PointerRegistry::default()),
                allocator: Mutex::new(allocator),
                local: RwLock::new(config.local_endpoint),
                outbound: Mutex::new(VecDeque::new()),
                retention_events: Mutex::new(VecDeque::new()),
                listeners: Mutex::new(SpaceListeners::default()),
                property_refs: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.inner.local.read().clone()
    }

    pub fn is_origin(&self, ptr: &Pointer) -> bool {
        let origin = ptr.origin();
        origin.is_local() || origin == self.local_endpoint()
    }

    // ---- creation ----

    /// Creates a pointer and initializes it with `value`.
    pub fn create(&self, value: Value, options: CreateOptions) -> Result<Pointer, PointerError> {
        let ptr = self.create_uninitialized(options)?;
        self.init_value(&ptr, value)?;
        Ok(ptr)
    }

    /// Creates a pointer whose value arrives later, through
    /// [`PointerSpace::init_value`]. Used by transforms and the loader.
    pub fn create_uninitialized(&self, options: CreateOptions) -> Result<Pointer, PointerError> {
        let anonymous = options.anonymous;
        let id = match options.id {
            Some(id) if !anonymous => {
                if self.inner.registry.read().contains(&id) {
                    return Err(PointerError::DuplicateBinding(id.to_string()));
                }
                id
            }
            _ if anonymous => provisional_id(),
            _ => self.allocate_id(),
        };
        let origin_given = options.origin.is_some();
        let origin = options
            .origin
            .unwrap_or_else(|| self.local_endpoint());
        let core = Arc::new(PointerCore::new(id, origin, options.shape));
        core.anonymous.store(anonymous, Ordering::SeqCst);
        core.persistent.store(options.persistent, Ordering::SeqCst);
        core.sealed.store(options.sealed, Ordering::SeqCst);
        if let Some(allowed) = options.allowed_access {
            *core.allowed_access.write() = Some(allowed);
        }
        self.inner.registry.write().insert(id, Arc::clone(&core));
        let ptr = Pointer { core };
        self.push_retention_event(id);
        debug!(pointer = %id, anonymous, "pointer created");
        ptr.core
            .created_in_context
            .store(!origin_given || self.is_origin(&ptr), Ordering::SeqCst);
        self.notify_added(&ptr);
        Ok(ptr)
    }

    /// Binds an existing cell to a new pointer, so mutations through
    /// either route hit the same value.
    pub fn create_with_cell(
        &self,
        cell: ValueCell,
        options: CreateOptions,
    ) -> Result<Pointer, PointerError> {
        let ptr = self.create_uninitialized(options)?;
        self.bind_cell(&ptr, cell)?;
        Ok(ptr)
    }

    /// Pointerizes a cell, or returns the pointer it is already bound
    /// to. The identity map guarantees the same cell never yields two
    /// different pointers.
    pub fn create_or_get(&self, cell: &ValueCell) -> Result<Pointer, PointerError> {
        let existing = self.inner.registry.read().pointer_for_cell(&cell.id());
        if let Some(id) = existing {
            if let Some(ptr) = self.get(&id) {
                return Ok(ptr);
            }
        }
        self.create_with_cell(cell.clone(), CreateOptions::default())
    }

    /// Creates a placeholder: a pointer that already has an observable
    /// value but no final id yet.
    pub fn insert_placeholder(&self, value: Value) -> Result<Pointer, PointerError> {
        let ptr = self.create_uninitialized(CreateOptions {
            anonymous: true,
            ..Default::default()
        })?;
        ptr.core.placeholder.store(true, Ordering::SeqCst);
        self.init_value(&ptr, value)?;
        Ok(ptr)
    }

    /// Promotes a placeholder to a routable pointer. With no explicit id
    /// a fresh local id is allocated.
    pub fn assign_id(
        &self,
        ptr: &Pointer,
        id: Option<PointerId>,
    ) -> Result<PointerId, PointerError> {
        if !ptr.is_placeholder() {
            return Err(PointerError::InvalidId(
                "pointer is not a placeholder".into(),
            ));
        }
        let new_id = match id {
            Some(id) => {
                if self.inner.registry.read().contains(&id) {
                    return Err(PointerError::DuplicateBinding(id.to_string()));
                }
                id
            }
            None => self.allocate_id(),
        };
        let old_id = ptr.id();
        self.inner.registry.write().rekey(&old_id, new_id);
        *ptr.core.id.write() = new_id;
        ptr.core.placeholder.store(false, Ordering::SeqCst);
        ptr.core.anonymous.store(false, Ordering::SeqCst);
        self.notify_added(ptr);
        Ok(new_id)
    }

    fn allocate_id(&self) -> PointerId {
        self.inner.allocator.lock().allocate(now_secs())
    }

    pub(crate) fn bind_cell(&self, ptr: &Pointer, cell: ValueCell) -> Result<(), PointerError> {
        {
            let mut registry = self.inner.registry.write();
            registry.bind_cell(cell.id(), ptr.id())?;
        }
        *ptr.core.slot.write() = ValueSlot::Strong(cell);
        Ok(())
    }

    // ---- lookup ----

    pub fn get(&self, id: &PointerId) -> Option<Pointer> {
        let core = self.inner.registry.read().get(id)?;
        Some(Pointer { core })
    }

    pub fn set_label(&self, ptr: &Pointer, label: &str) {
        self.inner.registry.write().set_label(label, ptr.id());
    }

    pub fn by_label(&self, label: &str) -> Option<Pointer> {
        let id = self.inner.registry.read().by_label(label)?;
        self.get(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.registry.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<PointerId> {
        self.inner.registry.read().ids()
    }

    // ---- flags and subscriptions ----

    pub fn set_persistent(&self, ptr: &Pointer, persistent: bool) {
        ptr.core.persistent.store(persistent, Ordering::SeqCst);
        if persistent {
            self.ensure_strong(ptr);
        }
        self.push_retention_event(ptr.id());
    }

    pub fn seal(&self, ptr: &Pointer) {
        ptr.core.sealed.store(true, Ordering::SeqCst);
    }

    pub fn set_allowed_access(&self, ptr: &Pointer, allowed: Option<HashSet<Endpoint>>) {
        *ptr.core.allowed_access.write() = allowed;
    }

    /// Checks whether `endpoint` may read this pointer.
    pub fn check_access(&self, ptr: &Pointer, endpoint: &Endpoint) -> Result<(), PointerError> {
        let allowed = ptr.core.allowed_access.read();
        match allowed.as_ref() {
            None => Ok(()),
            Some(set) if set.contains(endpoint) || set.contains(&endpoint.main()) => Ok(()),
            Some(_) => Err(PointerError::Permission {
                pointer: ptr.id().to_string(),
                endpoint: endpoint.to_string(),
            }),
        }
    }

    /// Registers a remote endpoint as a subscriber. Subscribers retain
    /// the pointer against garbage collection.
    pub fn add_subscriber(&self, ptr: &Pointer, endpoint: Endpoint) -> Result<(), PointerError> {
        self.check_access(ptr, &endpoint)?;
        let inserted = ptr.core.subscribers.write().insert(endpoint.clone());
        if inserted {
            self.inner
                .subscriptions
                .lock()
                .entry(endpoint)
                .or_default()
                .insert(ptr.id());
            self.ensure_strong(ptr);
            self.push_retention_event(ptr.id());
        }
        Ok(())
    }

    pub fn remove_subscriber(&self, ptr: &Pointer, endpoint: &Endpoint) -> bool {
        let removed = ptr.core.subscribers.write().remove(endpoint);
        if removed {
            let mut subscriptions = self.inner.subscriptions.lock();
            if let Some(set) = subscriptions.get_mut(endpoint) {
                set.remove(&ptr.id());
                if set.is_empty() {
                    subscriptions.remove(endpoint);
                }
            }
            self.push_retention_event(ptr.id());
        }
        removed
    }

    /// Endpoints currently holding at least one subscription here.
    pub fn subscriber_endpoints(&self) -> Vec<Endpoint> {
        self.inner.subscriptions.lock().keys().cloned().collect()
    }

    /// Drops every subscription `endpoint` holds. Returns the number of
    /// pointers it was removed from.
    pub fn clear_endpoint_subscriptions(&self, endpoint: &Endpoint) -> usize {
        let Some(ids) = self.inner.subscriptions.lock().remove(endpoint) else {
            return 0;
        };
        let mut cleared = 0;
        for id in ids {
            let Some(ptr) = self.get(&id) else { continue };
            if ptr.core.subscribers.write().remove(endpoint) {
                self.push_retention_event(id);
                cleared += 1;
            }
        }
        cleared
    }

    /// Records which endpoint this pointer receives updates from. Set
    /// by the synchronizer when a subscription is established or torn
    /// down.
    pub fn set_subscribed_to(&self, ptr: &Pointer, endpoint: Option<Endpoint>) {
        *ptr.core.subscribed_to.write() = endpoint;
    }

    /// Registers a callback to run when the pointer is deleted or
    /// collected.
    pub fn on_delete(&self, ptr: &Pointer, disposer: Disposer) {
        ptr.core.disposers.lock().push(disposer);
    }

    // ---- deletion and collection ----

    /// Removes a pointer from the space. Idempotent: deleting an
    /// already-deleted pointer returns `false`.
    pub fn delete(&self, id: &PointerId) -> bool {
        self.delete_internal(id, false)
    }

    /// Deletion path used by the collector: marks the pointer as
    /// collected so late accesses fail with `GarbageCollected`.
    pub fn finalize(&self, id: &PointerId) -> bool {
        self.delete_internal(id, true)
    }

    fn delete_internal(&self, id: &PointerId, collected: bool) -> bool {
        let Some(core) = self.inner.registry.write().remove(id) else {
            return false;
        };
        let ptr = Pointer { core };
        if collected {
            ptr.core.collected.store(true, Ordering::SeqCst);
        }
        self.detach_transform(&ptr);
        self.teardown_child_watch(&ptr);
        {
            let subscribers = ptr.core.subscribers.read().clone();
            if !subscribers.is_empty() {
                let mut subscriptions = self.inner.subscriptions.lock();
                for endpoint in subscribers {
                    if let Some(set) = subscriptions.get_mut(&endpoint) {
                        set.remove(id);
                        if set.is_empty() {
                            subscriptions.remove(&endpoint);
                        }
                    }
                }
            }
        }
        {
            let cell = ptr.core.slot.read().cell();
            if let Some(cell) = cell {
                self.inner.registry.write().unbind_cell(&cell.id());
            }
            *ptr.core.slot.write() = ValueSlot::Empty;
        }
        ptr.core.observers.lock().clear();
        ptr.core.observer_count.store(0, Ordering::SeqCst);
        let disposers: Vec<Disposer> = ptr.core.disposers.lock().drain(..).collect();
        for disposer in disposers {
            disposer();
        }
        if !ptr.is_anonymous() {
            for listener in &self.inner.listeners.lock().removed {
                listener(*id);
            }
        }
        debug!(pointer = %id, collected, "pointer removed");
        true
    }

    /// Downgrades the registry's value hold to a weak reference. Returns
    /// `false` when the pointer is unknown or became retained again.
    pub fn weaken_value(&self, id: &PointerId) -> bool {
        let Some(ptr) = self.get(id) else { return false };
        if ptr.core.retained() {
            return false;
        }
        let mut slot = ptr.core.slot.write();
        if let ValueSlot::Strong(cell) = &*slot {
            let weak = cell.downgrade();
            *slot = ValueSlot::Weak(weak);
        }
        true
    }

    /// Re-strengthens a weakened slot. Returns `false` when the value
    /// was already reclaimed.
    pub fn strengthen_value(&self, id: &PointerId) -> bool {
        let Some(ptr) = self.get(id) else { return false };
        self.ensure_strong(&ptr)
    }

    /// Whether a weakened pointer's value has been reclaimed.
    pub fn value_collected(&self, id: &PointerId) -> bool {
        let Some(ptr) = self.get(id) else { return false };
        let slot = ptr.core.slot.read();
        match &*slot {
            ValueSlot::Weak(weak) => weak.upgrade().is_none(),
            _ => false,
        }
    }

    pub fn is_retained(&self, id: &PointerId) -> bool {
        self.get(id).map(|ptr| ptr.core.retained()).unwrap_or(false)
    }

    pub fn meta(&self, id: &PointerId) -> Option<PointerMeta> {
        let ptr = self.get(id)?;
        Some(PointerMeta {
            id: *id,
            origin: ptr.origin(),
            subscribed_to: ptr.subscribed_to(),
            persistent: ptr.is_persistent(),
        })
    }

    pub(crate) fn ensure_strong(&self, ptr: &Pointer) -> bool {
        let mut slot = ptr.core.slot.write();
        match &*slot {
            ValueSlot::Weak(weak) => match weak.upgrade() {
                Some(cell) => {
                    *slot = ValueSlot::Strong(cell);
                    true
                }
                None => false,
            },
            _ => true,
        }
    }

    // ---- queues ----

    pub(crate) fn push_retention_event(&self, id: PointerId) {
        self.inner.retention_events.lock().push_back(id);
    }

    /// Pointers whose retention inputs changed since the last drain.
    /// Consumed by the collector each tick.
    pub fn drain_retention_events(&self) -> Vec<PointerId> {
        self.inner.retention_events.lock().drain(..).collect()
    }

    pub(crate) fn push_outbound(&self, update: OutboundUpdate) {
        self.inner.outbound.lock().push_back(update);
    }

    /// Mutations awaiting forwarding. Consumed by the synchronizer.
    pub fn drain_outbound(&self) -> Vec<OutboundUpdate> {
        self.inner.outbound.lock().drain(..).collect()
    }

    pub fn outbound_len(&self) -> usize {
        self.inner.outbound.lock().len()
    }

    // ---- space listeners ----

    pub fn on_pointer_added(&self, listener: impl Fn(&Pointer) + Send + 'static) {
        self.inner.listeners.lock().added.push(Box::new(listener));
    }

    pub fn on_pointer_removed(&self, listener: impl Fn(PointerId) + Send + 'static) {
        self.inner.listeners.lock().removed.push(Box::new(listener));
    }

    pub(crate) fn notify_added(&self, ptr: &Pointer) {
        if ptr.is_anonymous() {
            return;
        }
        for listener in &self.inner.listeners.lock().added {
            listener(ptr);
        }
    }

    // ---- observer plumbing shared with mutation/transform ----

    /// Delivers an update to the pointer's observers. Handlers run with
    /// no lock held; `Stop` results are collected and unregistered
    /// afterwards.
    pub(crate) fn dispatch(&self, ptr: &Pointer, update: &Update) {
        let targets = ptr.core.observers.lock().matching(update);
        if targets.is_empty() {
            return;
        }
        let mut stopped: Vec<ObserverId> = Vec::new();
        for (id, handler) in targets {
            if handler(update) == ObserverFlow::Stop {
                stopped.push(id);
            }
        }
        if !stopped.is_empty() {
            let mut removed = 0;
            {
                let mut observers = ptr.core.observers.lock();
                for id in stopped {
                    if observers.remove(id) {
                        removed += 1;
                    }
                }
            }
            if removed > 0 {
                self.observer_count_changed(ptr, -(removed as isize));
            }
        }
    }

    pub(crate) fn observer_count_changed(&self, ptr: &Pointer, delta: isize) {
        let prev = ptr.core.observer_count.load(Ordering::SeqCst);
        let count = if delta >= 0 {
            prev + delta as usize
        } else {
            prev.saturating_sub((-delta) as usize)
        };
        ptr.core.observer_count.store(count, Ordering::SeqCst);
        if count > 0 {
            self.ensure_strong(ptr);
            if prev == 0 {
                self.install_child_watch(ptr);
            }
        } else if prev > 0 {
            self.teardown_child_watch(ptr);
        }
        self.push_retention_event(ptr.id());
        self.transform_liveness_changed(ptr, count);
    }

    pub(crate) fn teardown_child_watch(&self, ptr: &Pointer) {
        let watches: Vec<_> = ptr.core.child_watch.lock().drain(..).collect();
        for (_, child_id, observer) in watches {
            if let Some(child) = self.get(&child_id) {
                self.unobserve(&child, observer);
            }
        }
    }
}
