//! The collection state machine.
//!
//! A pointer moves through three stages once it stops being retained:
//! pending (grace window), weakened (registry holds only a weak value
//! reference) and finalized (removed from the space). Regaining
//! retention at any stage before reclaim cancels the process and
//! re-strengthens the value hold.

use std::collections::HashMap;

use parking_lot::Mutex;
use tether_core::{Endpoint, PointerId};
use tether_reactive::PointerSpace;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Milliseconds a pointer stays pending before it is weakened.
    pub grace_ms: u64,
    /// Disables collection entirely when false.
    pub enabled: bool,
}

impl Default for GcConfig {
    fn default() -> GcConfig {
        GcConfig {
            grace_ms: 10_000,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Pointers finalized so far.
    pub collected: u64,
    /// Collections cancelled because retention came back.
    pub cancelled: u64,
    /// Pointers currently pending or weakened.
    pub pending: usize,
}

/// What remains of a pointer after finalization: enough to tell the
/// synchronizer which remote subscription to drop.
#[derive(Debug, Clone)]
pub struct FinalizeDescriptor {
    pub id: PointerId,
    pub origin: Endpoint,
    /// Endpoint the pointer received updates from, if it was subscribed.
    pub subscribed_to: Option<Endpoint>,
}

struct PendingEntry {
    due_at_ms: u64,
    weakened: bool,
    descriptor: FinalizeDescriptor,
}

/// Drives collection for one pointer space. Call [`GcCoordinator::tick`]
/// with the current time; the coordinator never spawns tasks itself.
pub struct GcCoordinator {
    space: PointerSpace,
    config: GcConfig,
    pending: Mutex<HashMap<PointerId, PendingEntry>>,
    stats: Mutex<GcStats>,
    unsubscribes: Mutex<Vec<FinalizeDescriptor>>,
}

impl GcCoordinator {
    pub fn new(space: PointerSpace) -> GcCoordinator {
        GcCoordinator::with_config(space, GcConfig::default())
    }

    pub fn with_config(space: PointerSpace, config: GcConfig) -> GcCoordinator {
        GcCoordinator {
            space,
            config,
            pending: Mutex::new(HashMap::new()),
            stats: Mutex::new(GcStats::default()),
            unsubscribes: Mutex::new(Vec::new()),
        }
    }

    /// One collection pass. Consumes the space's retention events,
    /// advances grace windows, weakens, sweeps and finalizes.
    pub fn tick(&self, now_ms: u64) {
        if !self.config.enabled {
            self.space.drain_retention_events();
            return;
        }

        // Stage 0: sort fresh retention events into pending/cancelled.
        for id in self.space.drain_retention_events() {
            let mut pending = self.pending.lock();
            if self.space.get(&id).is_none() {
                pending.remove(&id);
                continue;
            }
            if self.space.is_retained(&id) {
                if let Some(entry) = pending.remove(&id) {
                    if entry.weakened {
                        self.space.strengthen_value(&id);
                    }
                    self.stats.lock().cancelled += 1;
                    trace!(pointer = %id, "collection cancelled");
                }
            } else if !pending.contains_key(&id) {
                let Some(meta) = self.space.meta(&id) else { continue };
                pending.insert(
                    id,
                    PendingEntry {
                        due_at_ms: now_ms + self.config.grace_ms,
                        weakened: false,
                        descriptor: FinalizeDescriptor {
                            id,
                            origin: meta.origin,
                            subscribed_to: meta.subscribed_to,
                        },
                    },
                );
                trace!(pointer = %id, "collection pending");
            }
        }

        // Stage 1: weaken entries whose grace window elapsed.
        let due: Vec<PointerId> = {
            let pending = self.pending.lock();
            pending
                .iter()
                .filter(|(_, e)| !e.weakened && now_ms >= e.due_at_ms)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in due {
            if self.space.is_retained(&id) {
                self.pending.lock().remove(&id);
                self.stats.lock().cancelled += 1;
                continue;
            }
            if self.space.weaken_value(&id) {
                if let Some(entry) = self.pending.lock().get_mut(&id) {
                    // Refresh the subscription snapshot at weaken time.
                    if let Some(meta) = self.space.meta(&id) {
                        entry.descriptor.subscribed_to = meta.subscribed_to;
                    }
                    entry.weakened = true;
                }
                debug!(pointer = %id, "pointer weakened");
            } else {
                self.pending.lock().remove(&id);
            }
        }

        // Stage 2: sweep weakened entries whose value is gone.
        let weakened: Vec<PointerId> = {
            let pending = self.pending.lock();
            pending
                .iter()
                .filter(|(_, e)| e.weakened)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in weakened {
            if self.space.is_retained(&id) {
                // Retention came back before reclaim.
                if self.space.strengthen_value(&id) {
                    self.pending.lock().remove(&id);
                    self.stats.lock().cancelled += 1;
                    continue;
                }
            }
            if self.space.value_collected(&id) {
                let entry = self.pending.lock().remove(&id);
                self.space.finalize(&id);
                let mut stats = self.stats.lock();
                stats.collected += 1;
                drop(stats);
                if let Some(entry) = entry {
                    if entry.descriptor.subscribed_to.is_some() {
                        self.unsubscribes.lock().push(entry.descriptor);
                    }
                }
                debug!(pointer = %id, "pointer finalized");
            }
        }

        self.stats.lock().pending = self.pending.lock().len();
    }

    /// Descriptors of collected pointers that still held a remote
    /// subscription. The synchronizer drains these and unsubscribes.
    pub fn drain_unsubscribes(&self) -> Vec<FinalizeDescriptor> {
        self.unsubscribes.lock().drain(..).collect()
    }

    pub fn stats(&self) -> GcStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{Endpoint, Value};
    use tether_reactive::{CreateOptions, ObserverFlow};

    fn setup() -> (PointerSpace, GcCoordinator) {
        let space = PointerSpace::new(Endpoint::new("alice"));
        let gc = GcCoordinator::with_config(
            space.clone(),
            GcConfig {
                grace_ms: 100,
                enabled: true,
            },
        );
        (space, gc)
    }

    #[test]
    fn test_unretained_pointer_collected_after_grace() {
        let (space, gc) = setup();
        let ptr = space.create(Value::Int(1), CreateOptions::default()).unwrap();
        let id = ptr.id();
        gc.tick(0);
        assert!(space.get(&id).is_some());
        gc.tick(100);
        gc.tick(101);
        assert!(space.get(&id).is_none());
        assert_eq!(gc.stats().collected, 1);
    }

    #[test]
    fn test_persistent_pointer_survives() {
        let (space, gc) = setup();
        let ptr = space
            .create(
                Value::Int(1),
                CreateOptions {
                    persistent: true,
                    ..Default::default()
                },
            )
            .unwrap();
        gc.tick(0);
        gc.tick(1_000_000);
        gc.tick(1_000_001);
        assert!(space.get(&ptr.id()).is_some());
        assert_eq!(gc.stats().collected, 0);
    }

    #[test]
    fn test_observer_retains_pointer() {
        let (space, gc) = setup();
        let ptr = space.create(Value::Int(1), CreateOptions::default()).unwrap();
        space.observe(&ptr, |_| ObserverFlow::Continue);
        gc.tick(0);
        gc.tick(1_000_000);
        gc.tick(1_000_001);
        assert!(space.get(&ptr.id()).is_some());
    }

    #[test]
    fn test_retention_regained_during_grace_cancels() {
        let (space, gc) = setup();
        let ptr = space.create(Value::Int(1), CreateOptions::default()).unwrap();
        gc.tick(0);
        space.set_persistent(&ptr, true);
        gc.tick(200);
        gc.tick(201);
        assert!(space.get(&ptr.id()).is_some());
        assert!(gc.stats().cancelled >= 1);
    }

    #[test]
    fn test_external_cell_defers_finalization() {
        let (space, gc) = setup();
        let ptr = space.create(Value::Int(1), CreateOptions::default()).unwrap();
        let cell = space.cell(&ptr).unwrap();
        let id = ptr.id();
        gc.tick(0);
        gc.tick(100);
        gc.tick(101);
        // Weakened but not reclaimable while the cell handle lives.
        assert!(space.get(&id).is_some());
        drop(cell);
        gc.tick(102);
        assert!(space.get(&id).is_none());
    }

    #[test]
    fn test_collected_subscription_reported() {
        let (space, gc) = setup();
        let origin = Endpoint::new("origin");
        let ptr = space
            .create(
                Value::Int(1),
                CreateOptions {
                    origin: Some(origin.clone()),
                    ..Default::default()
                },
            )
            .unwrap();
        // Simulate an active subscription to the origin.
        space.set_subscribed_to(&ptr, Some(origin.clone()));
        let id = ptr.id();
        gc.tick(0);
        gc.tick(100);
        gc.tick(101);
        assert!(space.get(&id).is_none());
        let unsubscribes = gc.drain_unsubscribes();
        assert_eq!(unsubscribes.len(), 1);
        assert_eq!(unsubscribes[0].id, id);
        assert_eq!(unsubscribes[0].subscribed_to, Some(origin));
    }
}
