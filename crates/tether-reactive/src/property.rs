//! Property references: addressable (pointer, key) pairs.
//!
//! A `PropertyRef` lets one property of a compound pointer be passed
//! around, read, written and observed like a value of its own. The
//! space keeps a weak cache so asking for the same property twice
//! yields the same reference while anyone still holds it.

use std::sync::{Arc, Weak};

use tether_core::{Key, ObserveOptions, PointerError, Update, Value};

use crate::observe::{ObserveHandler, ObserverFlow, ObserverId};
use crate::pointer::Pointer;
use crate::space::PointerSpace;

pub(crate) struct PropertyRefInner {
    pointer: Pointer,
    key: Key,
}

/// Reference to one property of a pointer.
#[derive(Clone)]
pub struct PropertyRef {
    inner: Arc<PropertyRefInner>,
}

impl PropertyRef {
    pub fn pointer(&self) -> &Pointer {
        &self.inner.pointer
    }

    pub fn key(&self) -> &Key {
        &self.inner.key
    }

    pub fn get(&self, space: &PointerSpace) -> Result<Option<Value>, PointerError> {
        space.get_property(&self.inner.pointer, &self.inner.key)
    }

    pub fn set(&self, space: &PointerSpace, value: impl Into<Value>) -> Result<(), PointerError> {
        space.set(&self.inner.pointer, self.inner.key.clone(), value.into())
    }

    /// Observes only this property of the parent pointer.
    pub fn observe(
        &self,
        space: &PointerSpace,
        handler: impl Fn(&Update) -> ObserverFlow + Send + Sync + 'static,
    ) -> ObserverId {
        let handler: ObserveHandler = Arc::new(handler);
        space.observe_with(
            &self.inner.pointer,
            Some(self.inner.key.clone()),
            None,
            ObserveOptions::default(),
            handler,
        )
    }

    pub fn unobserve(&self, space: &PointerSpace, id: ObserverId) -> bool {
        space.unobserve(&self.inner.pointer, id)
    }

    pub(crate) fn downgrade(&self) -> Weak<PropertyRefInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_parts(pointer: Pointer, key: Key) -> PropertyRef {
        PropertyRef {
            inner: Arc::new(PropertyRefInner { pointer, key }),
        }
    }

    pub(crate) fn upgrade(weak: &Weak<PropertyRefInner>) -> Option<PropertyRef> {
        weak.upgrade().map(|inner| PropertyRef { inner })
    }

    /// Two refs are the same registration exactly when they share state.
    pub fn same_ref(&self, other: &PropertyRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PointerSpace {
    /// Returns the property reference for `(pointer, key)`, reusing the
    /// cached one while any holder keeps it alive.
    pub fn property(&self, ptr: &Pointer, key: impl Into<Key>) -> PropertyRef {
        let key = key.into();
        let cache_key = (ptr.id(), key.clone());
        let mut cache = self.inner.property_refs.lock();
        if let Some(weak) = cache.get(&cache_key) {
            if let Some(existing) = PropertyRef::upgrade(weak) {
                return existing;
            }
        }
        let fresh = PropertyRef::from_parts(ptr.clone(), key);
        cache.insert(cache_key, fresh.downgrade());
        // Drop entries whose refs were released.
        cache.retain(|_, weak| weak.strong_count() > 0);
        fresh
    }
}
