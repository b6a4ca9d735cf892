//! The synchronizer: resolving remote pointers and exchanging updates.
//!
//! One synchronizer serves one pointer space. It owns the load chain
//! (store, relay, origin, trusted fallbacks, context sender), pools
//! outgoing subscriptions, coalesces outgoing updates through the
//! scheduler, and answers peer messages as the space's server side.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tether_core::{Endpoint, PointerError, PointerId, TrustedPermission, UpdateOp, Value};
use tether_reactive::{CreateOptions, Pointer, PointerSpace};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::loader::{LazyPointer, LoadContext, LoadOutcome};
use crate::message::{PointerUpdate, PointerValue, SyncMessage, SyncResponse};
use crate::pool::{PoolConfig, SubscribePool};
use crate::scheduler::UpdateScheduler;
use crate::store::PointerStore;
use crate::transport::{MessageHandler, Transport, TransportError};

type SharedLoad = Shared<BoxFuture<'static, Result<PointerId, PointerError>>>;

#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub loaded: u64,
    pub updates_applied: u64,
    pub update_batches_sent: u64,
    pub subscribe_batches_sent: u64,
    pub failovers: u64,
}

pub struct Synchronizer {
    space: PointerSpace,
    transport: Arc<dyn Transport>,
    store: Arc<dyn PointerStore>,
    config: SyncConfig,
    scheduler: UpdateScheduler,
    pool: SubscribePool,
    /// In-flight loads, shared so concurrent loads of the same id
    /// collapse into one resolution.
    loading: Mutex<HashMap<PointerId, SharedLoad>>,
    /// Pointers we receive updates for, per source endpoint. Consulted
    /// when a source goes offline.
    watched: Mutex<HashMap<Endpoint, HashSet<PointerId>>>,
    stats: Mutex<SyncStats>,
    /// Self-reference handed to load futures, which outlive the borrow
    /// of the calling method.
    weak: Weak<Synchronizer>,
}

impl Synchronizer {
    pub fn new(
        space: PointerSpace,
        transport: Arc<dyn Transport>,
        store: Arc<dyn PointerStore>,
        config: SyncConfig,
    ) -> Arc<Synchronizer> {
        let pool = SubscribePool::new(PoolConfig {
            max_batch: config.pool_max_batch,
            delay_ms: config.pool_delay_ms,
        });
        Arc::new_cyclic(|weak| Synchronizer {
            space,
            transport,
            store,
            scheduler: UpdateScheduler::new(),
            pool,
            loading: Mutex::new(HashMap::new()),
            watched: Mutex::new(HashMap::new()),
            stats: Mutex::new(SyncStats::default()),
            weak: weak.clone(),
            config,
        })
    }

    pub fn space(&self) -> &PointerSpace {
        &self.space
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.lock().clone()
    }

    /// Opts a pointer into intermediate updates: every forwarded step
    /// is kept instead of coalescing to the latest state.
    pub fn set_intermediate_updates(&self, pointer: PointerId, enabled: bool) {
        self.scheduler.set_intermediate_updates(pointer, enabled);
    }

    // ---- loading ----

    /// Resolves a pointer id to a live pointer.
    ///
    /// Already-registered pointers return immediately. An id that is
    /// part of a reference cycle in the current context returns a
    /// deferred handle instead of deadlocking. Concurrent loads of the
    /// same id share one resolution; every caller gets the same result.
    pub async fn load(&self, id: PointerId, ctx: &LoadContext) -> Result<LoadOutcome, PointerError> {
        if let Some(ptr) = self.space.get(&id) {
            if ptr.is_initialized() {
                return Ok(LoadOutcome::Ready(ptr));
            }
        }
        if ctx.is_loading(&id) {
            return Ok(LoadOutcome::Deferred(LazyPointer::new(
                id,
                self.space.clone(),
            )));
        }

        let shared = {
            let mut loading = self.loading.lock();
            match loading.get(&id) {
                Some(existing) => existing.clone(),
                None => {
                    let weak = self.weak.clone();
                    let ctx = ctx.clone();
                    let fut: BoxFuture<'static, Result<PointerId, PointerError>> =
                        Box::pin(async move {
                            let Some(this) = weak.upgrade() else {
                                return Err(PointerError::Unresolved(id.to_string()));
                            };
                            ctx.begin(id);
                            let result = this.resolve(id, &ctx).await;
                            ctx.finish(&id);
                            this.loading.lock().remove(&id);
                            result.map(|_| id)
                        });
                    let shared = fut.shared();
                    loading.insert(id, shared.clone());
                    shared
                }
            }
        };
        shared.await?;

        let ptr = self
            .space
            .get(&id)
            .ok_or_else(|| PointerError::Unresolved(id.to_string()))?;
        self.stats.lock().loaded += 1;
        Ok(LoadOutcome::Ready(ptr))
    }

    /// The source chain: local store, relay for relay-tagged ids, the
    /// origin embedded in the id, trusted fallback sources, and finally
    /// the endpoint the triggering message came from.
    async fn resolve(&self, id: PointerId, ctx: &LoadContext) -> Result<(), PointerError> {
        if let Some(value) = self.store.get_pointer_value(&id) {
            let ptr = self.space.create_uninitialized(CreateOptions {
                id: Some(id),
                origin: Some(id.origin()),
                ..Default::default()
            })?;
            self.space.init_value(&ptr, value)?;
            debug!(pointer = %id, "loaded from local store");
            return Ok(());
        }

        let Some(tag) = id.tag() else {
            return Err(PointerError::Unresolved(id.to_string()));
        };

        if tag.is_relayed() {
            let relay = self
                .config
                .relay
                .clone()
                .ok_or_else(|| PointerError::Unresolved(id.to_string()))?;
            return self.subscribe_value(id, relay).await.map(|_| ());
        }

        let origin = id.origin();
        let local = self.space.local_endpoint();
        if origin != local {
            match self.subscribe_value(id, origin.clone()).await {
                Ok(_) => return Ok(()),
                Err(origin_err) => {
                    if self.config.retry_fallback {
                        for fallback in
                            self.config.trusted_with(TrustedPermission::FallbackPointerSource)
                        {
                            if self.subscribe_value(id, fallback).await.is_ok() {
                                self.stats.lock().failovers += 1;
                                return Ok(());
                            }
                        }
                    }
                    if let Some(sender) = ctx.sender() {
                        if sender != origin {
                            return self.subscribe_value(id, sender).await.map(|_| ());
                        }
                    }
                    return Err(origin_err);
                }
            }
        }

        // Our own id that we do not know: the only possible source is
        // whoever sent it to us.
        if let Some(sender) = ctx.sender() {
            return self.subscribe_value(id, sender).await.map(|_| ());
        }
        Err(PointerError::Unresolved(id.to_string()))
    }

    /// Subscribes at `endpoint` with a value fetch and registers the
    /// received state locally.
    async fn subscribe_value(
        &self,
        id: PointerId,
        endpoint: Endpoint,
    ) -> Result<Pointer, PointerError> {
        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let response = self
            .transport
            .request(
                &endpoint,
                SyncMessage::Subscribe {
                    pointers: vec![id],
                    want_value: true,
                },
                timeout,
            )
            .await
            .map_err(|err| PointerError::Network {
                pointer: id.to_string(),
                reason: err.to_string(),
            })?;
        match response {
            SyncResponse::Values(values) => {
                let found = values
                    .into_iter()
                    .find(|pv| pv.pointer == id)
                    .ok_or_else(|| PointerError::Unresolved(id.to_string()))?;
                self.adopt_value(id, found.value, &endpoint)
            }
            SyncResponse::NotFound { .. } | SyncResponse::Ack => {
                Err(PointerError::Unresolved(id.to_string()))
            }
            SyncResponse::Denied { .. } => Err(PointerError::Permission {
                pointer: id.to_string(),
                endpoint: endpoint.to_string(),
            }),
        }
    }

    fn adopt_value(
        &self,
        id: PointerId,
        value: Value,
        from: &Endpoint,
    ) -> Result<Pointer, PointerError> {
        let ptr = match self.space.get(&id) {
            Some(ptr) => {
                if ptr.is_initialized() {
                    self.space
                        .apply_remote(&ptr, UpdateOp::Replace { value }, from.clone())?;
                } else {
                    self.space.init_value(&ptr, value)?;
                }
                ptr
            }
            None => {
                let ptr = self.space.create_uninitialized(CreateOptions {
                    id: Some(id),
                    origin: Some(id.origin()),
                    ..Default::default()
                })?;
                self.space.init_value(&ptr, value)?;
                ptr
            }
        };
        self.space.set_subscribed_to(&ptr, Some(from.clone()));
        self.watched
            .lock()
            .entry(from.clone())
            .or_default()
            .insert(id);
        Ok(ptr)
    }

    // ---- subscriptions without a value fetch ----

    /// Requests updates for an already-materialized pointer. The
    /// request is pooled; a full batch is sent immediately, the rest on
    /// the next tick.
    pub async fn subscribe_for_updates(
        &self,
        ptr: &Pointer,
        endpoint: Option<Endpoint>,
        now_ms: u64,
    ) {
        // Transform pointers derive their value locally and are never
        // subscribed.
        if ptr.is_transform() {
            return;
        }
        if ptr.subscribed_to().is_some() {
            return;
        }
        let target = endpoint.unwrap_or_else(|| ptr.origin());
        if target == self.space.local_endpoint() || target.is_local() {
            warn!(pointer = %ptr.id(), "ignoring subscription to self");
            return;
        }
        if let Some(batch) = self.pool.push(&target, ptr.id(), now_ms) {
            self.send_pooled(target, batch).await;
        }
    }

    async fn send_pooled(&self, endpoint: Endpoint, pointers: Vec<PointerId>) {
        // Pointers deleted while pooled are dropped from the batch.
        let pointers: Vec<PointerId> = pointers
            .into_iter()
            .filter(|id| self.space.get(id).is_some())
            .collect();
        if pointers.is_empty() {
            return;
        }
        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let message = SyncMessage::Subscribe {
            pointers: pointers.clone(),
            want_value: false,
        };
        match self.transport.request(&endpoint, message, timeout).await {
            Ok(SyncResponse::Denied { pointer }) => {
                warn!(%endpoint, %pointer, "pooled subscribe denied");
            }
            Ok(_) => {
                for id in pointers {
                    if let Some(ptr) = self.space.get(&id) {
                        self.space.set_subscribed_to(&ptr, Some(endpoint.clone()));
                        self.watched
                            .lock()
                            .entry(endpoint.clone())
                            .or_default()
                            .insert(id);
                    }
                }
                self.stats.lock().subscribe_batches_sent += 1;
            }
            Err(err) => {
                warn!(%endpoint, %err, "pooled subscribe failed");
            }
        }
    }

    /// Drops the remote subscription of a collected pointer.
    pub async fn unsubscribe_collected(&self, id: PointerId, source: Endpoint) {
        if let Some(set) = self.watched.lock().get_mut(&source) {
            set.remove(&id);
        }
        if let Err(err) = self
            .transport
            .send(&source, SyncMessage::Unsubscribe { pointers: vec![id] })
            .await
        {
            debug!(%source, %err, "unsubscribe after collection failed");
        }
    }

    // ---- failover ----

    /// Re-homes every pointer subscribed at `endpoint` onto a trusted
    /// fallback source.
    pub async fn handle_endpoint_offline(&self, endpoint: &Endpoint) {
        let ids: Vec<PointerId> = match self.watched.lock().remove(endpoint) {
            Some(set) => set.into_iter().collect(),
            None => return,
        };
        if ids.is_empty() {
            return;
        }
        info!(%endpoint, count = ids.len(), "subscription source offline");
        let fallbacks = self
            .config
            .trusted_with(TrustedPermission::FallbackPointerSource);
        for id in ids {
            let Some(ptr) = self.space.get(&id) else { continue };
            self.space.set_subscribed_to(&ptr, None);
            if !self.config.retry_fallback {
                continue;
            }
            let mut recovered = false;
            for fallback in &fallbacks {
                if fallback == endpoint {
                    continue;
                }
                if self.subscribe_value(id, fallback.clone()).await.is_ok() {
                    recovered = true;
                    self.stats.lock().failovers += 1;
                    break;
                }
            }
            if !recovered {
                warn!(pointer = %id, "no fallback source reachable");
            }
        }
    }

    // ---- outgoing updates ----

    /// Moves gateway output into the per-endpoint scheduler queues.
    pub fn pump(&self) {
        for update in self.space.drain_outbound() {
            if let Some(origin) = update.to_origin {
                self.scheduler
                    .queue(origin, update.pointer, update.op.clone());
            }
            for subscriber in update.subscribers {
                self.scheduler
                    .queue(subscriber, update.pointer, update.op.clone());
            }
        }
    }

    /// Sends everything queued. Delivery failures are logged and the
    /// batch is dropped; the next mutation re-syncs the state.
    pub async fn flush(&self) {
        for (endpoint, updates) in self.scheduler.flush() {
            let count = updates.len();
            match self
                .transport
                .send(&endpoint, SyncMessage::Update { updates })
                .await
            {
                Ok(()) => {
                    self.stats.lock().update_batches_sent += 1;
                    debug!(%endpoint, count, "update batch sent");
                }
                Err(err) => warn!(%endpoint, %err, "update batch failed"),
            }
        }
    }

    /// One synchronizer pass: pump the gateway output, flush due
    /// subscription batches and update queues, then check watched
    /// sources for liveness.
    pub async fn tick(&self, now_ms: u64) {
        self.pump();
        for (endpoint, pointers) in self.pool.due(now_ms) {
            self.send_pooled(endpoint, pointers).await;
        }
        self.flush().await;
        self.check_sources().await;
    }

    async fn check_sources(&self) {
        let sources: Vec<Endpoint> = self.watched.lock().keys().cloned().collect();
        for source in sources {
            if !self.transport.is_online(&source).await {
                self.handle_endpoint_offline(&source).await;
            }
        }
        // Subscribers that went offline get dropped; they re-subscribe
        // when they come back.
        for subscriber in self.space.subscriber_endpoints() {
            if !self.transport.is_online(&subscriber).await {
                let cleared = self.space.clear_endpoint_subscriptions(&subscriber);
                if cleared > 0 {
                    info!(endpoint = %subscriber, cleared, "dropped subscriptions of offline endpoint");
                }
            }
        }
    }

    /// Write-through persistence for a pointer that should survive the
    /// process.
    pub fn persist(&self, ptr: &Pointer) -> Result<(), PointerError> {
        let value = self.space.value(ptr)?;
        self.store.set_pointer(&ptr.id(), &value);
        Ok(())
    }
}

/// Server side: answers subscribe, unsubscribe, update and fetch
/// messages from peers.
impl MessageHandler for Synchronizer {
    fn handle(
        &self,
        from: &Endpoint,
        message: SyncMessage,
    ) -> Result<SyncResponse, TransportError> {
        match message {
            SyncMessage::Subscribe {
                pointers,
                want_value,
            } => {
                let mut values = Vec::new();
                for id in pointers {
                    let Some(ptr) = self.space.get(&id) else {
                        return Ok(SyncResponse::NotFound { pointer: id });
                    };
                    if !ptr.is_initialized() {
                        return Ok(SyncResponse::NotFound { pointer: id });
                    }
                    if self.space.add_subscriber(&ptr, from.clone()).is_err() {
                        return Ok(SyncResponse::Denied { pointer: id });
                    }
                    if want_value {
                        let value = self
                            .space
                            .value(&ptr)
                            .map_err(|err| TransportError::SendFailed(err.to_string()))?;
                        values.push(PointerValue { pointer: id, value });
                    }
                }
                if want_value {
                    Ok(SyncResponse::Values(values))
                } else {
                    Ok(SyncResponse::Ack)
                }
            }
            SyncMessage::Unsubscribe { pointers } => {
                for id in pointers {
                    if let Some(ptr) = self.space.get(&id) {
                        self.space.remove_subscriber(&ptr, from);
                    }
                }
                Ok(SyncResponse::Ack)
            }
            SyncMessage::Update { updates } => {
                for PointerUpdate { pointer, op } in updates {
                    match self.space.get(&pointer) {
                        Some(ptr) => match self.space.apply_remote(&ptr, op, from.clone()) {
                            Ok(()) => self.stats.lock().updates_applied += 1,
                            Err(error) => {
                                warn!(pointer = %pointer, %error, "remote update rejected")
                            }
                        },
                        None => {
                            debug!(pointer = %pointer, "update for unknown pointer dropped")
                        }
                    }
                }
                Ok(SyncResponse::Ack)
            }
            SyncMessage::Fetch { pointer } => {
                let Some(ptr) = self.space.get(&pointer) else {
                    return Ok(SyncResponse::NotFound { pointer });
                };
                if self.space.check_access(&ptr, from).is_err() {
                    return Ok(SyncResponse::Denied { pointer });
                }
                let value = self
                    .space
                    .value(&ptr)
                    .map_err(|err| TransportError::SendFailed(err.to_string()))?;
                Ok(SyncResponse::Values(vec![PointerValue { pointer, value }]))
            }
        }
    }
}
