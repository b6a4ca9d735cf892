//! Pooling of outgoing subscribe requests.
//!
//! Loading a graph of pointers from one endpoint would otherwise send a
//! burst of single-pointer subscribe messages. Value-less subscriptions
//! are buffered per target endpoint and flushed as one batch when the
//! batch fills up or the pool delay elapses.

use std::collections::HashMap;

use parking_lot::Mutex;
use tether_core::{Endpoint, PointerId};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_batch: usize,
    pub delay_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            max_batch: 50,
            delay_ms: 50,
        }
    }
}

struct Bucket {
    pointers: Vec<PointerId>,
    opened_at_ms: u64,
}

pub struct SubscribePool {
    config: PoolConfig,
    buckets: Mutex<HashMap<Endpoint, Bucket>>,
}

impl SubscribePool {
    pub fn new(config: PoolConfig) -> SubscribePool {
        SubscribePool {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Buffers one subscription. Returns the full batch when the
    /// threshold is reached, in which case the caller sends it now.
    pub fn push(
        &self,
        endpoint: &Endpoint,
        pointer: PointerId,
        now_ms: u64,
    ) -> Option<Vec<PointerId>> {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(endpoint.clone()).or_insert_with(|| Bucket {
            pointers: Vec::new(),
            opened_at_ms: now_ms,
        });
        if !bucket.pointers.contains(&pointer) {
            bucket.pointers.push(pointer);
        }
        if bucket.pointers.len() >= self.config.max_batch {
            let batch = std::mem::take(&mut bucket.pointers);
            buckets.remove(endpoint);
            Some(batch)
        } else {
            None
        }
    }

    /// Batches whose delay elapsed.
    pub fn due(&self, now_ms: u64) -> Vec<(Endpoint, Vec<PointerId>)> {
        let mut buckets = self.buckets.lock();
        let expired: Vec<Endpoint> = buckets
            .iter()
            .filter(|(_, bucket)| now_ms >= bucket.opened_at_ms + self.config.delay_ms)
            .map(|(endpoint, _)| endpoint.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|endpoint| {
                buckets
                    .remove(&endpoint)
                    .map(|bucket| (endpoint, bucket.pointers))
            })
            .collect()
    }

    /// Everything still buffered, regardless of age.
    pub fn flush_all(&self) -> Vec<(Endpoint, Vec<PointerId>)> {
        self.buckets
            .lock()
            .drain()
            .map(|(endpoint, bucket)| (endpoint, bucket.pointers))
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.buckets
            .lock()
            .values()
            .map(|bucket| bucket.pointers.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{AddressTag, IdAllocator};

    fn ids(n: usize) -> Vec<PointerId> {
        let mut alloc = IdAllocator::new(AddressTag::Endpoint, &Endpoint::new("alice"));
        (0..n).map(|_| alloc.allocate(1_700_000_000)).collect()
    }

    #[test]
    fn test_batch_threshold_flush() {
        let pool = SubscribePool::new(PoolConfig {
            max_batch: 3,
            delay_ms: 1_000,
        });
        let target = Endpoint::new("origin");
        let ids = ids(3);
        assert!(pool.push(&target, ids[0], 0).is_none());
        assert!(pool.push(&target, ids[1], 0).is_none());
        let batch = pool.push(&target, ids[2], 0).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn test_delay_flush() {
        let pool = SubscribePool::new(PoolConfig {
            max_batch: 100,
            delay_ms: 50,
        });
        let target = Endpoint::new("origin");
        let ids = ids(2);
        pool.push(&target, ids[0], 0);
        pool.push(&target, ids[1], 10);
        assert!(pool.due(49).is_empty());
        let due = pool.due(50);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1.len(), 2);
    }

    #[test]
    fn test_duplicate_pointer_ignored() {
        let pool = SubscribePool::new(PoolConfig::default());
        let target = Endpoint::new("origin");
        let ids = ids(1);
        pool.push(&target, ids[0], 0);
        pool.push(&target, ids[0], 0);
        assert_eq!(pool.pending(), 1);
    }
}
