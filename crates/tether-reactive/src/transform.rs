//! Derived pointers: fixed-input and smart transforms.
//!
//! A transform pointer computes its value from other pointers. Smart
//! transforms discover their dependencies at evaluation time through an
//! explicit capture scope ([`TransformCtx`]): every read made through
//! the scope is recorded, and after each evaluation the recorded set is
//! diffed against the previous one so only current dependencies keep
//! observers registered.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tether_core::{Key, ObserveOptions, PointerError, PointerId, Update, UpdateKind, Value};
use tracing::{debug, error, warn};

use crate::observe::{ObserverFlow, ObserverId};
use crate::pointer::{CreateOptions, Pointer};
use crate::space::{PointerSpace, SpaceInner, UpdateSource};

/// Why a transform evaluation did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformAbort {
    /// A captured weak reference is gone; tear the transform down.
    Disposed,
    /// The computation failed; the previous value is kept.
    Failed(String),
}

/// A transform computation. Reads made through the [`TransformCtx`] are
/// captured as dependencies. Returning `Ok(None)` after initialization
/// skips the update and keeps the previous value.
pub type TransformFn =
    Arc<dyn Fn(&TransformCtx) -> Result<Option<Value>, TransformAbort> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct TransformOptions {
    /// Memoize results keyed by a hash of all dependency values.
    pub cache: bool,
    /// Defer the first evaluation until the first read.
    pub init_lazy: bool,
    /// Keep dependency observers registered even with no observers on
    /// the transform itself.
    pub force_live: bool,
    /// Suppress the warning for transforms that captured nothing.
    pub allow_static: bool,
}

impl Default for TransformOptions {
    fn default() -> TransformOptions {
        TransformOptions {
            cache: false,
            init_lazy: false,
            force_live: false,
            allow_static: false,
        }
    }
}

/// Dependencies captured during one evaluation.
#[derive(Default, Debug, Clone, PartialEq)]
pub(crate) struct CaptureSet {
    /// Whole-pointer dependencies.
    refs: HashSet<PointerId>,
    /// Per-key dependencies.
    keyed: HashSet<(PointerId, Key)>,
}

impl CaptureSet {
    fn is_empty(&self) -> bool {
        self.refs.is_empty() && self.keyed.is_empty()
    }
}

/// Explicit capture scope handed to a transform function. All dependency
/// reads go through it; reads made any other way are invisible to the
/// dependency tracker.
pub struct TransformCtx<'a> {
    space: &'a PointerSpace,
    captured: Mutex<CaptureSet>,
}

impl<'a> TransformCtx<'a> {
    fn new(space: &'a PointerSpace) -> TransformCtx<'a> {
        TransformCtx {
            space,
            captured: Mutex::new(CaptureSet::default()),
        }
    }

    /// Reads a pointer's whole value and records it as a dependency.
    pub fn get(&self, ptr: &Pointer) -> Result<Value, PointerError> {
        self.captured.lock().refs.insert(ptr.id());
        self.space.value(ptr)
    }

    /// Reads one property and records a per-key dependency, so changes
    /// to other keys of the same pointer do not trigger re-evaluation.
    pub fn get_key(
        &self,
        ptr: &Pointer,
        key: impl Into<Key>,
    ) -> Result<Option<Value>, PointerError> {
        let key = key.into();
        self.captured
            .lock()
            .keyed
            .insert((ptr.id(), key.clone()));
        self.space.get_property(ptr, &key)
    }

    fn take(self) -> CaptureSet {
        self.captured.into_inner()
    }
}

/// State attached to a transform pointer.
pub(crate) struct TransformSource {
    func: TransformFn,
    options: TransformOptions,
    /// Live transforms hold observers on their dependencies and update
    /// eagerly; lazy ones re-evaluate on read.
    live: AtomicBool,
    force_live: AtomicBool,
    init_pending: AtomicBool,
    /// Guards against a dependency observer re-entering the evaluation.
    updating: AtomicBool,
    is_static: AtomicBool,
    deps: Mutex<DepState>,
    cache: Mutex<HashMap<[u8; 32], Value>>,
}

#[derive(Default)]
struct DepState {
    captured: CaptureSet,
    /// Observer registrations on dependency pointers, for teardown.
    registrations: Vec<(PointerId, ObserverId)>,
}

impl TransformSource {
    fn new(func: TransformFn, options: TransformOptions) -> TransformSource {
        TransformSource {
            live: AtomicBool::new(false),
            force_live: AtomicBool::new(options.force_live),
            init_pending: AtomicBool::new(options.init_lazy),
            updating: AtomicBool::new(false),
            is_static: AtomicBool::new(false),
            deps: Mutex::new(DepState::default()),
            cache: Mutex::new(HashMap::new()),
            func,
            options,
        }
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

impl PointerSpace {
    /// Creates a fixed-input transform: the result recomputes whenever
    /// one of `inputs` changes, and the dependency set never changes.
    pub fn transform(
        &self,
        inputs: &[Pointer],
        f: impl Fn(&[Value]) -> Value + Send + Sync + 'static,
    ) -> Result<Pointer, PointerError> {
        let inputs: Vec<Pointer> = inputs.to_vec();
        self.smart_transform(
            Arc::new(move |ctx: &TransformCtx| {
                let mut values = Vec::with_capacity(inputs.len());
                for input in &inputs {
                    values.push(
                        ctx.get(input)
                            .map_err(|e| TransformAbort::Failed(e.to_string()))?,
                    );
                }
                Ok(Some(f(&values)))
            }),
            TransformOptions::default(),
        )
    }

    /// Creates a smart transform with runtime dependency discovery.
    pub fn smart_transform(
        &self,
        func: TransformFn,
        options: TransformOptions,
    ) -> Result<Pointer, PointerError> {
        let ptr = self.create_uninitialized(CreateOptions::default())?;
        let source = Arc::new(TransformSource::new(func, options.clone()));
        *ptr.core.transform.write() = Some(Arc::clone(&source));
        if !options.init_lazy {
            self.evaluate_transform(&ptr, true)?;
        }
        Ok(ptr)
    }

    /// Re-evaluates a transform pointer now. Dependency observers call
    /// this; it is also the lazy refresh path.
    pub(crate) fn evaluate_transform(
        &self,
        ptr: &Pointer,
        initial: bool,
    ) -> Result<(), PointerError> {
        let Some(source) = ptr.core.transform.read().clone() else {
            return Ok(());
        };
        if source.updating.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.evaluate_transform_inner(ptr, &source, initial);
        source.updating.store(false, Ordering::SeqCst);
        result
    }

    fn evaluate_transform_inner(
        &self,
        ptr: &Pointer,
        source: &Arc<TransformSource>,
        initial: bool,
    ) -> Result<(), PointerError> {
        // Cache lookup against the current dependency values, before
        // running the function at all.
        if source.options.cache && !initial {
            let key = self.dep_hash(source);
            if let Some(key) = key {
                if let Some(cached) = source.cache.lock().get(&key).cloned() {
                    return self.store_transform_result(ptr, source, cached, initial);
                }
            }
        }

        let ctx = TransformCtx::new(self);
        let outcome = (source.func)(&ctx);
        let captured = ctx.take();

        let value = match outcome {
            Err(TransformAbort::Disposed) => {
                debug!(pointer = %ptr.id(), "transform disposed");
                self.detach_transform(ptr);
                return Ok(());
            }
            Err(TransformAbort::Failed(reason)) => {
                error!(pointer = %ptr.id(), %reason, "transform evaluation failed");
                return Ok(());
            }
            Ok(None) if initial => {
                // Roll the half-built pointer back out of the registry.
                let id = ptr.id();
                self.delete(&id);
                return Err(PointerError::InvalidTransformResult(id.to_string()));
            }
            Ok(None) => return Ok(()),
            Ok(Some(value)) => value,
        };

        if initial && captured.is_empty() && !source.options.allow_static {
            warn!(
                pointer = %ptr.id(),
                "transform captured no dependencies and will never update"
            );
            source.is_static.store(true, Ordering::SeqCst);
        }

        // Non-primitive results cannot be diffed cheaply on read, so
        // the transform stays permanently live.
        if !value.is_primitive() {
            source.force_live.store(true, Ordering::SeqCst);
        }

        if source.options.cache {
            let mut hasher = Sha256::new();
            if self.hash_captured(&captured, &mut hasher) {
                let mut key = [0u8; 32];
                key.copy_from_slice(&hasher.finalize());
                source.cache.lock().insert(key, value.clone());
            }
        }

        let should_be_live = source.is_live()
            || source.force_live.load(Ordering::SeqCst)
            || ptr.observer_count() > 0;
        if should_be_live {
            self.resubscribe_deps(ptr, source, &captured);
            source.live.store(true, Ordering::SeqCst);
        } else {
            source.deps.lock().captured = captured;
        }

        self.store_transform_result(ptr, source, value, initial)
    }

    fn store_transform_result(
        &self,
        ptr: &Pointer,
        _source: &Arc<TransformSource>,
        value: Value,
        initial: bool,
    ) -> Result<(), PointerError> {
        if initial && !ptr.is_initialized() {
            self.init_value_from(ptr, value, UpdateSource::Local, true)
        } else {
            self.replace_from(ptr, value, UpdateSource::Local, true)
        }
    }

    /// Diffs the freshly captured dependency set against the previous
    /// one: observers on dropped dependencies are unregistered, new
    /// dependencies gain one.
    fn resubscribe_deps(
        &self,
        ptr: &Pointer,
        source: &Arc<TransformSource>,
        captured: &CaptureSet,
    ) {
        let stale: Vec<(PointerId, ObserverId)> = {
            let deps = source.deps.lock();
            if deps.captured == *captured && !deps.registrations.is_empty() {
                return;
            }
            deps.registrations.clone()
        };
        for (dep_id, observer) in stale {
            if let Some(dep) = self.get(&dep_id) {
                self.unobserve(&dep, observer);
            }
        }

        let mut registrations = Vec::new();
        let mut register = |dep_id: PointerId, key: Option<Key>| {
            let Some(dep) = self.get(&dep_id) else { return };
            let weak: Weak<SpaceInner> = Arc::downgrade(&self.inner);
            let target = ptr.id();
            let observer = self.observe_with(
                &dep,
                key,
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
                    let Some(target_ptr) = space.get(&target) else {
                        return ObserverFlow::Stop;
                    };
                    if let Err(error) = space.evaluate_transform(&target_ptr, false) {
                        error!(pointer = %target, %error, "transform update failed");
                    }
                    ObserverFlow::Continue
                }),
            );
            registrations.push((dep_id, observer));
        };
        for dep_id in &captured.refs {
            register(*dep_id, None);
        }
        for (dep_id, key) in &captured.keyed {
            // A whole-value dependency already covers every key.
            if !captured.refs.contains(dep_id) {
                register(*dep_id, Some(key.clone()));
            }
        }

        let mut deps = source.deps.lock();
        deps.captured = captured.clone();
        deps.registrations = registrations;
    }

    /// Hash of the current values of all recorded dependencies, used as
    /// the memoization key. `None` when any dependency is unreadable.
    fn dep_hash(&self, source: &Arc<TransformSource>) -> Option<[u8; 32]> {
        let captured = source.deps.lock().captured.clone();
        if captured.is_empty() {
            return None;
        }
        let mut hasher = Sha256::new();
        if !self.hash_captured(&captured, &mut hasher) {
            return None;
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&hasher.finalize());
        Some(key)
    }

    fn hash_captured(&self, captured: &CaptureSet, hasher: &mut Sha256) -> bool {
        if captured.is_empty() {
            return false;
        }
        let mut refs: Vec<PointerId> = captured.refs.iter().copied().collect();
        refs.sort();
        for dep_id in refs {
            let Some(dep) = self.get(&dep_id) else { return false };
            let Ok(value) = self.value(&dep) else { return false };
            let mut bytes = Vec::new();
            value.canonical_bytes(&mut bytes);
            hasher.update(dep_id.as_bytes());
            hasher.update(&bytes);
        }
        let mut keyed: Vec<(PointerId, Key)> = captured.keyed.iter().cloned().collect();
        keyed.sort_by_key(|(id, key)| (*id, key.to_string()));
        for (dep_id, key) in keyed {
            let Some(dep) = self.get(&dep_id) else { return false };
            let Ok(value) = self.get_property(&dep, &key) else { return false };
            let mut bytes = Vec::new();
            value.unwrap_or(Value::Null).canonical_bytes(&mut bytes);
            hasher.update(dep_id.as_bytes());
            hasher.update(key.to_string().as_bytes());
            hasher.update(&bytes);
        }
        true
    }

    /// Lazy refresh on read: a non-live transform re-evaluates before
    /// its value is returned.
    pub(crate) fn maybe_refresh_transform(&self, ptr: &Pointer) {
        let Some(source) = ptr.core.transform.read().clone() else {
            return;
        };
        let pending_init = source.init_pending.swap(false, Ordering::SeqCst);
        if pending_init {
            if let Err(error) = self.evaluate_transform(ptr, true) {
                error!(pointer = %ptr.id(), %error, "lazy transform init failed");
            }
            return;
        }
        if !source.is_live() && !source.is_static.load(Ordering::SeqCst) {
            if let Err(error) = self.evaluate_transform(ptr, false) {
                error!(pointer = %ptr.id(), %error, "lazy transform refresh failed");
            }
        }
    }

    /// Switches a transform between live and lazy as its observer count
    /// crosses zero.
    pub(crate) fn transform_liveness_changed(&self, ptr: &Pointer, observer_count: usize) {
        let Some(source) = ptr.core.transform.read().clone() else {
            return;
        };
        if observer_count > 0 && !source.is_live() {
            if let Err(error) = self.evaluate_transform(ptr, false) {
                error!(pointer = %ptr.id(), %error, "transform activation failed");
            }
            // evaluate marks the transform live through resubscribe
        } else if observer_count == 0
            && source.is_live()
            && !source.force_live.load(Ordering::SeqCst)
        {
            source.live.store(false, Ordering::SeqCst);
            let stale: Vec<(PointerId, ObserverId)> =
                std::mem::take(&mut source.deps.lock().registrations);
            for (dep_id, observer) in stale {
                if let Some(dep) = self.get(&dep_id) {
                    self.unobserve(&dep, observer);
                }
            }
        }
    }

    /// Removes the transform source and every dependency observer.
    pub(crate) fn detach_transform(&self, ptr: &Pointer) {
        let Some(source) = ptr.core.transform.write().take() else {
            return;
        };
        source.live.store(false, Ordering::SeqCst);
        let stale: Vec<(PointerId, ObserverId)> =
            std::mem::take(&mut source.deps.lock().registrations);
        for (dep_id, observer) in stale {
            if let Some(dep) = self.get(&dep_id) {
                self.unobserve(&dep, observer);
            }
        }
    }
}
