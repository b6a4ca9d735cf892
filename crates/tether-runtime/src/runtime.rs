//! The runtime: one pointer space plus its collector and synchronizer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tether_core::{AddressTag, Endpoint};
use tether_gc::{GcConfig, GcCoordinator, GcStats};
use tether_reactive::{PointerSpace, SpaceConfig};
use tether_sync::{PointerStore, SyncConfig, SyncStats, Synchronizer, Transport};
use tracing::info;

#[derive(Clone)]
pub struct RuntimeConfig {
    /// Identity of this runtime on the network.
    pub endpoint: Endpoint,
    /// Address tag stamped into locally allocated pointer ids.
    pub address_tag: AddressTag,
    pub gc: GcConfig,
    pub sync: SyncConfig,
    /// Interval of the background driver spawned by
    /// [`Runtime::spawn_driver`], in milliseconds.
    pub tick_interval_ms: u64,
}

impl RuntimeConfig {
    pub fn new(endpoint: Endpoint) -> RuntimeConfig {
        RuntimeConfig {
            endpoint,
            address_tag: AddressTag::Endpoint,
            gc: GcConfig::default(),
            sync: SyncConfig::default(),
            tick_interval_ms: 1_000,
        }
    }
}

/// Composes a [`PointerSpace`] with garbage collection and network
/// synchronization. Most applications create one runtime per process,
/// attach it to a transport, and either drive it with [`Runtime::tick`]
/// or let [`Runtime::spawn_driver`] do so on an interval.
pub struct Runtime {
    space: PointerSpace,
    collector: GcCoordinator,
    sync: Arc<Synchronizer>,
    tick_interval_ms: u64,
    started: Instant,
}

impl Runtime {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn PointerStore>,
        config: RuntimeConfig,
    ) -> Arc<Runtime> {
        let space = PointerSpace::with_config(SpaceConfig {
            local_endpoint: config.endpoint.clone(),
            address_tag: config.address_tag,
        });
        let collector = GcCoordinator::with_config(space.clone(), config.gc);
        let sync = Synchronizer::new(space.clone(), transport, store, config.sync);
        info!(endpoint = %config.endpoint, "runtime started");
        Arc::new(Runtime {
            space,
            collector,
            sync,
            tick_interval_ms: config.tick_interval_ms,
            started: Instant::now(),
        })
    }

    pub fn space(&self) -> &PointerSpace {
        &self.space
    }

    pub fn collector(&self) -> &GcCoordinator {
        &self.collector
    }

    pub fn sync(&self) -> &Arc<Synchronizer> {
        &self.sync
    }

    pub fn gc_stats(&self) -> GcStats {
        self.collector.stats()
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.sync.stats()
    }

    /// Milliseconds since the runtime was created, the clock fed to
    /// [`Runtime::tick`] by the background driver.
    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// One maintenance pass: run the collector, unsubscribe collected
    /// pointers from their remote sources, then let the synchronizer
    /// flush its queues and check source liveness.
    pub async fn tick(&self, now_ms: u64) {
        self.collector.tick(now_ms);
        for descriptor in self.collector.drain_unsubscribes() {
            if let Some(source) = descriptor.subscribed_to {
                self.sync.unsubscribe_collected(descriptor.id, source).await;
            }
        }
        self.sync.tick(now_ms).await;
    }

    /// Spawns a tokio task ticking the runtime on its configured
    /// interval. Aborting the handle stops the driver; pointer state is
    /// unaffected.
    pub fn spawn_driver(self: &Arc<Runtime>) -> tokio::task::JoinHandle<()> {
        let runtime = Arc::clone(self);
        let period = Duration::from_millis(runtime.tick_interval_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                runtime.tick(runtime.now_ms()).await;
            }
        })
    }
}
