//! The mutation gateway: validate, shadow-write, notify, forward.
//!
//! Every change to a pointer's value, local or remote, passes through
//! the methods here. The sequence is fixed: access and shape checks
//! first, then the write into the cell, then observer notification,
//! then an [`crate::space::OutboundUpdate`] for the synchronizer. A
//! re-entrancy flag on the pointer rejects mutations issued from inside
//! an observer of the same pointer.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use tether_core::{
    BatchId, Endpoint, Key, ObserveOptions, PointerError, PointerId, Update, UpdateKind, UpdateOp,
    Value,
};
use crate::cell::ValueCell;
use crate::observe::{ObserveHandler, ObserverFlow, ObserverId, OwnerToken};
use crate::pointer::{Pointer, PointerCore, ValueSlot};
use crate::space::{OutboundUpdate, PointerSpace, SpaceInner, UpdateSource};

/// Releases the re-entrancy flag when the mutation completes, including
/// on error paths.
struct ApplyGuard<'a> {
    core: &'a PointerCore,
}

impl<'a> ApplyGuard<'a> {
    fn acquire(ptr: &'a Pointer) -> Result<ApplyGuard<'a>, PointerError> {
        if ptr
            .core
            .applying
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PointerError::ReentrantMutation(ptr.id().to_string()));
        }
        Ok(ApplyGuard { core: &ptr.core })
    }
}

impl Drop for ApplyGuard<'_> {
    fn drop(&mut self) {
        self.core.applying.store(false, Ordering::SeqCst);
    }
}

impl PointerSpace {
    // ---- reads ----

    /// The pointer's current value. Refreshes a lazy transform first.
    pub fn value(&self, ptr: &Pointer) -> Result<Value, PointerError> {
        self.maybe_refresh_transform(ptr);
        Ok(self.checked_cell(ptr)?.get())
    }

    /// Strong handle to the pointer's value cell. Holding it keeps the
    /// value alive independently of the pointer's retention.
    pub fn cell(&self, ptr: &Pointer) -> Result<ValueCell, PointerError> {
        self.checked_cell(ptr)
    }

    /// Reads one property of a compound value.
    pub fn get_property(
        &self,
        ptr: &Pointer,
        key: &Key,
    ) -> Result<Option<Value>, PointerError> {
        self.maybe_refresh_transform(ptr);
        let cell = self.checked_cell(ptr)?;
        Ok(cell.with(|value| value.get(key).cloned()))
    }

    pub(crate) fn checked_cell(&self, ptr: &Pointer) -> Result<ValueCell, PointerError> {
        if ptr.was_collected() {
            return Err(PointerError::GarbageCollected(ptr.id().to_string()));
        }
        let slot = ptr.core.slot.read();
        match &*slot {
            ValueSlot::Empty => Err(PointerError::Uninitialized(ptr.id().to_string())),
            ValueSlot::Strong(cell) => Ok(cell.clone()),
            ValueSlot::Weak(weak) => weak
                .upgrade()
                .ok_or_else(|| PointerError::GarbageCollected(ptr.id().to_string())),
        }
    }

    // ---- whole-value writes ----

    /// Initializes the pointer's value. A pointer is initialized exactly
    /// once; later whole-value changes go through [`PointerSpace::replace`].
    pub fn init_value(&self, ptr: &Pointer, value: Value) -> Result<(), PointerError> {
        self.init_value_from(ptr, value, UpdateSource::Local, false)
    }

    pub(crate) fn init_value_from(
        &self,
        ptr: &Pointer,
        value: Value,
        source: UpdateSource,
        is_transform: bool,
    ) -> Result<(), PointerError> {
        if ptr.is_initialized() {
            return Err(PointerError::DuplicateBinding(ptr.id().to_string()));
        }
        let _guard = ApplyGuard::acquire(ptr)?;
        let cell = ValueCell::new(value.clone());
        self.bind_cell(ptr, cell)?;
        ptr.core.initialized.store(true, Ordering::SeqCst);
        let mut update = Update::new(UpdateKind::Init);
        update.value = Some(value.clone());
        update.is_transform = is_transform;
        self.dispatch(ptr, &update);
        self.forward(ptr, UpdateOp::Replace { value }, &source, is_transform);
        Ok(())
    }

    /// Replaces the whole value.
    pub fn replace(&self, ptr: &Pointer, value: Value) -> Result<(), PointerError> {
        self.replace_from(ptr, value, UpdateSource::Local, false)
    }

    pub(crate) fn replace_from(
        &self,
        ptr: &Pointer,
        value: Value,
        source: UpdateSource,
        is_transform: bool,
    ) -> Result<(), PointerError> {
        if !ptr.is_initialized() {
            return self.init_value_from(ptr, value, source, is_transform);
        }
        self.check_writable(ptr)?;
        let _guard = ApplyGuard::acquire(ptr)?;
        let cell = self.checked_cell(ptr)?;
        let previous = cell.get();
        if previous == value {
            return Ok(());
        }
        cell.set(value.clone());
        let mut update = Update::new(UpdateKind::Update);
        update.value = Some(value.clone());
        update.previous = Some(previous);
        update.is_transform = is_transform;
        self.dispatch(ptr, &update);
        self.forward(ptr, UpdateOp::Replace { value }, &source, is_transform);
        Ok(())
    }

    // ---- property writes ----

    /// Sets one property. Emits `SET` for overwrites and `ADD` for
    /// first-time keys. Writing a value equal to the current one is a
    /// no-op: no event, no forwarding.
    pub fn set(
        &self,
        ptr: &Pointer,
        key: impl Into<Key>,
        value: impl Into<Value>,
    ) -> Result<(), PointerError> {
        self.set_from(ptr, key.into(), value.into(), UpdateSource::Local)
    }

    pub(crate) fn set_from(
        &self,
        ptr: &Pointer,
        key: Key,
        value: Value,
        source: UpdateSource,
    ) -> Result<(), PointerError> {
        self.check_writable(ptr)?;
        let _guard = ApplyGuard::acquire(ptr)?;
        let value = match ptr.core.shape.read().check_property(&key, &value)? {
            Some(widened) => widened,
            None => value,
        };
        let cell = self.checked_cell(ptr)?;
        let mut previous: Option<Value> = None;
        let mut unchanged = false;
        let mut invalid: Option<&'static str> = None;
        cell.with_mut(|current| match (&mut *current, &key) {
            (Value::Map(map), Key::Text(name)) => {
                previous = map.get(name.as_str()).cloned();
                if previous.as_ref() == Some(&value) {
                    unchanged = true;
                } else {
                    map.insert(name.clone(), value.clone());
                }
            }
            (Value::List(list), Key::Index(index)) => {
                previous = list.get(*index).cloned();
                if previous.as_ref() == Some(&value) {
                    unchanged = true;
                } else if *index < list.len() {
                    list[*index] = value.clone();
                } else if *index == list.len() {
                    list.push(value.clone());
                } else {
                    invalid = Some("index is past the end of the list");
                }
            }
            _ => invalid = Some("value does not hold properties"),
        });
        if let Some(reason) = invalid {
            return Err(PointerError::InvalidProperty {
                key: key.to_string(),
                reason: reason.to_string(),
            });
        }
        if unchanged {
            return Ok(());
        }
        self.sync_key_watch(ptr, &key, &value);
        let kind = if previous.is_some() {
            UpdateKind::Set
        } else {
            UpdateKind::Add
        };
        let mut update = Update::new(kind);
        update.key = Some(key.clone());
        update.value = Some(value.clone());
        update.previous = previous;
        self.dispatch(ptr, &update);
        self.forward(ptr, UpdateOp::Set { key, value }, &source, false);
        Ok(())
    }

    /// Removes a property by key. Emits `BEFORE_DELETE` before the
    /// shadow write, then `DELETE`.
    pub fn delete_property(&self, ptr: &Pointer, key: impl Into<Key>) -> Result<(), PointerError> {
        self.delete_property_from(ptr, key.into(), UpdateSource::Local)
    }

    pub(crate) fn delete_property_from(
        &self,
        ptr: &Pointer,
        key: Key,
        source: UpdateSource,
    ) -> Result<(), PointerError> {
        self.check_writable(ptr)?;
        let _guard = ApplyGuard::acquire(ptr)?;
        let cell = self.checked_cell(ptr)?;
        let existing = cell.with(|value| value.get(&key).cloned());
        let Some(existing) = existing else {
            return Ok(());
        };
        let batch = BatchId::next();
        let mut before = Update::new(UpdateKind::BeforeDelete);
        before.key = Some(key.clone());
        before.previous = Some(existing.clone());
        before.batch = Some(batch);
        self.dispatch(ptr, &before);
        cell.with_mut(|current| match (&mut *current, &key) {
            (Value::Map(map), Key::Text(name)) => {
                map.shift_remove(name.as_str());
            }
            (Value::List(list), Key::Index(index)) => {
                if *index < list.len() {
                    list.remove(*index);
                }
            }
            _ => {}
        });
        self.unwatch_key(ptr, &key);
        let mut update = Update::new(UpdateKind::Delete);
        update.key = Some(key.clone());
        update.previous = Some(existing);
        update.batch = Some(batch);
        self.dispatch(ptr, &update);
        self.forward(ptr, UpdateOp::Delete { key }, &source, false);
        Ok(())
    }

    /// Removes every entry of a compound value.
    pub fn clear(&self, ptr: &Pointer) -> Result<(), PointerError> {
        self.clear_from(ptr, UpdateSource::Local)
    }

    pub(crate) fn clear_from(
        &self,
        ptr: &Pointer,
        source: UpdateSource,
    ) -> Result<(), PointerError> {
        self.check_writable(ptr)?;
        let _guard = ApplyGuard::acquire(ptr)?;
        let cell = self.checked_cell(ptr)?;
        let previous = cell.get();
        if previous.is_empty() {
            return Ok(());
        }
        let batch = BatchId::next();
        let mut before = Update::new(UpdateKind::BeforeDelete);
        before.previous = Some(previous.clone());
        before.batch = Some(batch);
        self.dispatch(ptr, &before);
        cell.with_mut(|current| match current {
            Value::Map(map) => map.clear(),
            Value::List(list) => list.clear(),
            _ => {}
        });
        self.teardown_child_watch(ptr);
        let mut update = Update::new(UpdateKind::Clear);
        update.previous = Some(previous);
        update.batch = Some(batch);
        self.dispatch(ptr, &update);
        self.forward(ptr, UpdateOp::Clear, &source, false);
        Ok(())
    }

    /// Appends an element to a list value.
    pub fn add(&self, ptr: &Pointer, value: impl Into<Value>) -> Result<(), PointerError> {
        self.add_from(ptr, value.into(), UpdateSource::Local)
    }

    pub(crate) fn add_from(
        &self,
        ptr: &Pointer,
        value: Value,
        source: UpdateSource,
    ) -> Result<(), PointerError> {
        self.check_writable(ptr)?;
        let _guard = ApplyGuard::acquire(ptr)?;
        let cell = self.checked_cell(ptr)?;
        let mut index = None;
        cell.with_mut(|current| {
            if let Value::List(list) = current {
                list.push(value.clone());
                index = Some(list.len() - 1);
            }
        });
        let Some(index) = index else {
            return Err(PointerError::InvalidProperty {
                key: "-".into(),
                reason: "cannot append to a non-list value".into(),
            });
        };
        let mut update = Update::new(UpdateKind::Add);
        update.key = Some(Key::Index(index));
        update.value = Some(value.clone());
        self.dispatch(ptr, &update);
        self.forward(ptr, UpdateOp::Add { value }, &source, false);
        Ok(())
    }

    /// Removes the first element equal to `value` from a list. Emits
    /// `BEFORE_REMOVE` then `REMOVE`.
    pub fn remove_value(&self, ptr: &Pointer, value: impl Into<Value>) -> Result<(), PointerError> {
        self.remove_value_from(ptr, value.into(), UpdateSource::Local)
    }

    pub(crate) fn remove_value_from(
        &self,
        ptr: &Pointer,
        value: Value,
        source: UpdateSource,
    ) -> Result<(), PointerError> {
        self.check_writable(ptr)?;
        let _guard = ApplyGuard::acquire(ptr)?;
        let cell = self.checked_cell(ptr)?;
        let index = cell.with(|current| match current {
            Value::List(list) => list.iter().position(|item| *item == value),
            _ => None,
        });
        let Some(index) = index else {
            return Ok(());
        };
        let batch = BatchId::next();
        let mut before = Update::new(UpdateKind::BeforeRemove);
        before.key = Some(Key::Index(index));
        before.value = Some(value.clone());
        before.batch = Some(batch);
        self.dispatch(ptr, &before);
        cell.with_mut(|current| {
            if let Value::List(list) = current {
                if index < list.len() {
                    list.remove(index);
                }
            }
        });
        let mut update = Update::new(UpdateKind::Remove);
        update.key = Some(Key::Index(index));
        update.value = Some(value.clone());
        update.batch = Some(batch);
        self.dispatch(ptr, &update);
        self.forward(ptr, UpdateOp::Remove { value }, &source, false);
        Ok(())
    }

    /// Splices a list: removes `delete_count` elements at `start` and
    /// inserts `values` in their place. All resulting events share one
    /// batch id, and the forwarded operation is a minimal edit rather
    /// than a whole-value replacement.
    pub fn splice(
        &self,
        ptr: &Pointer,
        start: usize,
        delete_count: usize,
        values: Vec<Value>,
    ) -> Result<(), PointerError> {
        self.splice_from(ptr, start, delete_count, values, UpdateSource::Local)
    }

    pub(crate) fn splice_from(
        &self,
        ptr: &Pointer,
        start: usize,
        delete_count: usize,
        values: Vec<Value>,
        source: UpdateSource,
    ) -> Result<(), PointerError> {
        self.check_writable(ptr)?;
        let _guard = ApplyGuard::acquire(ptr)?;
        let cell = self.checked_cell(ptr)?;
        let previous = cell.with(|current| match current {
            Value::List(list) => Some(list.clone()),
            _ => None,
        });
        let Some(previous) = previous else {
            return Err(PointerError::InvalidProperty {
                key: start.to_string(),
                reason: "cannot splice a non-list value".into(),
            });
        };
        let start = start.min(previous.len());
        let delete_count = delete_count.min(previous.len() - start);
        if delete_count == 0 && values.is_empty() {
            return Ok(());
        }

        let batch = BatchId::next();
        let old_len = previous.len();
        let new_len = old_len - delete_count + values.len();

        // Elements that fall off the end of the list are announced
        // before the write so observers can still read them in place.
        if new_len < old_len {
            for index in (new_len..old_len).rev() {
                let mut before = Update::new(UpdateKind::BeforeDelete);
                before.key = Some(Key::Index(index));
                before.previous = Some(previous[index].clone());
                before.batch = Some(batch);
                self.dispatch(ptr, &before);
            }
        }

        let mut next = previous.clone();
        next.splice(start..start + delete_count, values.iter().cloned());
        cell.with_mut(|current| {
            if let Value::List(list) = current {
                *list = next.clone();
            }
        });

        // Index-wise diff from the highest touched index down, so
        // observers see deletions before overwrites of lower indexes.
        for index in (start..old_len.max(new_len)).rev() {
            if index >= new_len {
                let mut update = Update::new(UpdateKind::Delete);
                update.key = Some(Key::Index(index));
                update.previous = Some(previous[index].clone());
                update.batch = Some(batch);
                self.dispatch(ptr, &update);
            } else if previous.get(index) != next.get(index) {
                let mut update = Update::new(UpdateKind::Set);
                update.key = Some(Key::Index(index));
                update.value = Some(next[index].clone());
                update.previous = previous.get(index).cloned();
                update.batch = Some(batch);
                self.dispatch(ptr, &update);
            }
        }

        let op = if values.is_empty() {
            UpdateOp::SpliceDelete {
                start,
                count: delete_count,
            }
        } else {
            UpdateOp::SpliceInsert {
                start,
                delete_count,
                values,
            }
        };
        self.forward(ptr, op, &source, false);
        Ok(())
    }

    // ---- remote entry point ----

    /// Applies an operation received from a remote endpoint. The source
    /// endpoint is excluded from forwarding so updates never echo back.
    pub fn apply_remote(
        &self,
        ptr: &Pointer,
        op: UpdateOp,
        from: Endpoint,
    ) -> Result<(), PointerError> {
        let source = UpdateSource::Remote(from);
        match op {
            UpdateOp::Replace { value } => self.replace_from(ptr, value, source, false),
            UpdateOp::Set { key, value } => self.set_from(ptr, key, value, source),
            UpdateOp::Delete { key } => self.delete_property_from(ptr, key, source),
            UpdateOp::Clear => self.clear_from(ptr, source),
            UpdateOp::Add { value } => self.add_from(ptr, value, source),
            UpdateOp::Remove { value } => self.remove_value_from(ptr, value, source),
            UpdateOp::SpliceDelete { start, count } => {
                self.splice_from(ptr, start, count, Vec::new(), source)
            }
            UpdateOp::SpliceInsert {
                start,
                delete_count,
                values,
            } => self.splice_from(ptr, start, delete_count, values, source),
        }
    }

    // ---- observers ----

    /// Registers a general observer with default options.
    pub fn observe(
        &self,
        ptr: &Pointer,
        handler: impl Fn(&Update) -> ObserverFlow + Send + Sync + 'static,
    ) -> ObserverId {
        self.observe_with(ptr, None, None, ObserveOptions::default(), Arc::new(handler))
    }

    /// Registers an observer for a single property key.
    pub fn observe_key(
        &self,
        ptr: &Pointer,
        key: impl Into<Key>,
        handler: impl Fn(&Update) -> ObserverFlow + Send + Sync + 'static,
    ) -> ObserverId {
        self.observe_with(
            ptr,
            Some(key.into()),
            None,
            ObserveOptions::default(),
            Arc::new(handler),
        )
    }

    pub fn observe_with(
        &self,
        ptr: &Pointer,
        key: Option<Key>,
        owner: Option<OwnerToken>,
        options: ObserveOptions,
        handler: ObserveHandler,
    ) -> ObserverId {
        let id = ptr
            .core
            .observers
            .lock()
            .insert(key, owner, options, handler);
        self.observer_count_changed(ptr, 1);
        id
    }

    pub fn unobserve(&self, ptr: &Pointer, id: ObserverId) -> bool {
        let removed = ptr.core.observers.lock().remove(id);
        if removed {
            self.observer_count_changed(ptr, -1);
        }
        removed
    }

    /// Removes every observer registered under `owner`.
    pub fn unobserve_owner(&self, ptr: &Pointer, owner: OwnerToken) -> usize {
        let removed = ptr.core.observers.lock().remove_owner(owner);
        if removed > 0 {
            self.observer_count_changed(ptr, -(removed as isize));
        }
        removed
    }

    // ---- child update republication ----

    /// Keeps the child watch for one key in line with the value just
    /// written there.
    fn sync_key_watch(&self, ptr: &Pointer, key: &Key, value: &Value) {
        self.unwatch_key(ptr, key);
        if ptr.observer_count() == 0 {
            return;
        }
        if let (Key::Text(_), Value::Ref(child_id)) = (key, value) {
            self.watch_key(ptr, key.clone(), *child_id);
        }
    }

    /// Installs watches for every referenced child of a map value. Runs
    /// when the pointer gains its first observer.
    pub(crate) fn install_child_watch(&self, ptr: &Pointer) {
        let Ok(cell) = self.checked_cell(ptr) else {
            return;
        };
        let refs: Vec<(Key, PointerId)> = cell.with(|value| match value {
            Value::Map(map) => map
                .iter()
                .filter_map(|(key, value)| match value {
                    Value::Ref(id) => Some((Key::Text(key.clone()), *id)),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        });
        for (key, child_id) in refs {
            self.watch_key(ptr, key, child_id);
        }
    }

    fn watch_key(&self, ptr: &Pointer, key: Key, child_id: PointerId) {
        let Some(child) = self.get(&child_id) else {
            return;
        };
        let parent_id = ptr.id();
        let weak: Weak<SpaceInner> = Arc::downgrade(&self.inner);
        let key_for_handler = key.clone();
        let observer = self.observe_with(
            &child,
            None,
            None,
            ObserveOptions::default(),
            Arc::new(move |update: &Update| {
                if matches!(
                    update.kind,
                    UpdateKind::BeforeDelete | UpdateKind::BeforeRemove
                ) {
                    return ObserverFlow::Continue;
                }
                let Some(inner) = weak.upgrade() else {
                    return ObserverFlow::Stop;
                };
                let space = PointerSpace { inner };
                let Some(parent) = space.get(&parent_id) else {
                    return ObserverFlow::Stop;
                };
                let mut republished = Update::new(UpdateKind::Set);
                republished.key = Some(key_for_handler.clone());
                republished.value = Some(Value::Ref(child_id));
                republished.is_child_update = true;
                republished.is_transform = update.is_transform;
                space.dispatch(&parent, &republished);
                ObserverFlow::Continue
            }),
        );
        ptr.core.child_watch.lock().push((key, child_id, observer));
    }

    fn unwatch_key(&self, ptr: &Pointer, key: &Key) {
        let entries: Vec<(Key, PointerId, ObserverId)> = {
            let mut watch = ptr.core.child_watch.lock();
            let (matched, rest): (Vec<_>, Vec<_>) =
                watch.drain(..).partition(|(k, _, _)| k == key);
            *watch = rest;
            matched
        };
        for (_, child_id, observer) in entries {
            if let Some(child) = self.get(&child_id) {
                self.unobserve(&child, observer);
            }
        }
    }

    // ---- shared gateway pieces ----

    fn check_writable(&self, ptr: &Pointer) -> Result<(), PointerError> {
        if ptr.was_collected() {
            return Err(PointerError::GarbageCollected(ptr.id().to_string()));
        }
        if ptr.is_sealed() {
            return Err(PointerError::Sealed(ptr.id().to_string()));
        }
        if !ptr.is_initialized() {
            return Err(PointerError::Uninitialized(ptr.id().to_string()));
        }
        Ok(())
    }

    /// Queues the forwarded form of a mutation for the synchronizer.
    /// Anonymous pointers are never forwarded.
    fn forward(&self, ptr: &Pointer, op: UpdateOp, source: &UpdateSource, is_transform: bool) {
        if ptr.is_anonymous() || ptr.is_placeholder() {
            return;
        }
        let exclude = match source {
            UpdateSource::Local => None,
            UpdateSource::Remote(endpoint) => Some(endpoint.clone()),
        };
        let origin = ptr.origin();
        let to_origin = if !self.is_origin(ptr)
            && !origin.is_local()
            && exclude.as_ref() != Some(&origin)
        {
            Some(origin)
        } else {
            None
        };
        let subscribers: Vec<Endpoint> = ptr
            .core
            .subscribers
            .read()
            .iter()
            .filter(|endpoint| exclude.as_ref() != Some(*endpoint))
            .cloned()
            .collect();
        if to_origin.is_none() && subscribers.is_empty() {
            return;
        }
        self.push_outbound(OutboundUpdate {
            pointer: ptr.id(),
            op,
            to_origin,
            subscribers,
            is_transform,
        });
    }
}
