//! Synchronizer configuration.

use std::collections::HashMap;

use tether_core::{Endpoint, TrustedPermission};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Timeout for value-carrying subscribe requests, in milliseconds.
    pub request_timeout_ms: u64,
    /// How long value-less subscribe requests may sit in the pool
    /// before they are flushed as one batch.
    pub pool_delay_ms: u64,
    /// Pool flush threshold per target endpoint.
    pub pool_max_batch: usize,
    /// Relay endpoint serving relay-tagged pointer ids.
    pub relay: Option<Endpoint>,
    /// Endpoints trusted with elevated roles, such as serving pointer
    /// values when an origin is offline.
    pub trusted: HashMap<Endpoint, Vec<TrustedPermission>>,
    /// Try trusted fallback sources when the origin cannot be reached.
    pub retry_fallback: bool,
}

impl Default for SyncConfig {
    fn default() -> SyncConfig {
        SyncConfig {
            request_timeout_ms: 5_000,
            pool_delay_ms: 50,
            pool_max_batch: 50,
            relay: None,
            trusted: HashMap::new(),
            retry_fallback: true,
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder {
            config: SyncConfig::default(),
        }
    }

    /// Trusted endpoints holding `permission`.
    pub fn trusted_with(&self, permission: TrustedPermission) -> Vec<Endpoint> {
        self.trusted
            .iter()
            .filter(|(_, perms)| perms.contains(&permission))
            .map(|(endpoint, _)| endpoint.clone())
            .collect()
    }
}

pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.request_timeout_ms = ms;
        self
    }

    pub fn pool_delay_ms(mut self, ms: u64) -> Self {
        self.config.pool_delay_ms = ms;
        self
    }

    pub fn pool_max_batch(mut self, max: usize) -> Self {
        self.config.pool_max_batch = max;
        self
    }

    pub fn relay(mut self, endpoint: Endpoint) -> Self {
        self.config.relay = Some(endpoint);
        self
    }

    pub fn trust(mut self, endpoint: Endpoint, permissions: Vec<TrustedPermission>) -> Self {
        self.config.trusted.insert(endpoint, permissions);
        self
    }

    pub fn retry_fallback(mut self, retry: bool) -> Self {
        self.config.retry_fallback = retry;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}
