//! Transport abstraction and the in-memory network used in tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tether_core::Endpoint;

use crate::message::{SyncMessage, SyncResponse};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("endpoint {0} is offline")]
    Offline(String),
    #[error("endpoint {0} is unknown")]
    Unknown(String),
    #[error("request to {0} timed out")]
    Timeout(String),
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Receives messages addressed to one endpoint.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, from: &Endpoint, message: SyncMessage) -> Result<SyncResponse, TransportError>;
}

/// Delivery of sync messages between endpoints.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Fire-and-forget delivery.
    async fn send(&self, to: &Endpoint, message: SyncMessage) -> Result<(), TransportError>;

    /// Request/response delivery with a timeout.
    async fn request(
        &self,
        to: &Endpoint,
        message: SyncMessage,
        timeout: Duration,
    ) -> Result<SyncResponse, TransportError>;

    async fn is_online(&self, endpoint: &Endpoint) -> bool;
}

struct Peer {
    handler: Option<Arc<dyn MessageHandler>>,
    online: bool,
}

/// Shared in-memory network. Every registered endpoint gets a
/// [`MemoryTransport`] that routes through this table.
#[derive(Default)]
pub struct MemoryNetwork {
    peers: RwLock<HashMap<Endpoint, Peer>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<MemoryNetwork> {
        Arc::new(MemoryNetwork::default())
    }

    /// Transport handle for an endpoint. The endpoint cannot receive
    /// messages until a handler is attached.
    pub fn transport(self: &Arc<MemoryNetwork>, endpoint: Endpoint) -> MemoryTransport {
        self.peers.write().entry(endpoint.clone()).or_insert(Peer {
            handler: None,
            online: true,
        });
        MemoryTransport {
            local: endpoint,
            network: Arc::clone(self),
        }
    }

    /// Attaches the message handler for an endpoint, typically the
    /// synchronizer built on top of the transport handle.
    pub fn attach(&self, endpoint: &Endpoint, handler: Arc<dyn MessageHandler>) {
        let mut peers = self.peers.write();
        match peers.get_mut(endpoint) {
            Some(peer) => peer.handler = Some(handler),
            None => {
                peers.insert(
                    endpoint.clone(),
                    Peer {
                        handler: Some(handler),
                        online: true,
                    },
                );
            }
        }
    }

    pub fn register(
        self: &Arc<MemoryNetwork>,
        endpoint: Endpoint,
        handler: Arc<dyn MessageHandler>,
    ) -> MemoryTransport {
        let transport = self.transport(endpoint.clone());
        self.attach(&endpoint, handler);
        transport
    }

    /// Simulates an endpoint going offline or coming back.
    pub fn set_online(&self, endpoint: &Endpoint, online: bool) {
        if let Some(peer) = self.peers.write().get_mut(endpoint) {
            peer.online = online;
        }
    }

    fn deliver(
        &self,
        from: &Endpoint,
        to: &Endpoint,
        message: SyncMessage,
    ) -> Result<SyncResponse, TransportError> {
        let peers = self.peers.read();
        let peer = peers
            .get(to)
            .ok_or_else(|| TransportError::Unknown(to.to_string()))?;
        if !peer.online {
            return Err(TransportError::Offline(to.to_string()));
        }
        let handler = peer
            .handler
            .clone()
            .ok_or_else(|| TransportError::Unknown(to.to_string()))?;
        drop(peers);
        handler.handle(from, message)
    }
}

/// Transport for one endpoint on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    local: Endpoint,
    network: Arc<MemoryNetwork>,
}

impl MemoryTransport {
    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, to: &Endpoint, message: SyncMessage) -> Result<(), TransportError> {
        self.network.deliver(&self.local, to, message).map(|_| ())
    }

    async fn request(
        &self,
        to: &Endpoint,
        message: SyncMessage,
        _timeout: Duration,
    ) -> Result<SyncResponse, TransportError> {
        self.network.deliver(&self.local, to, message)
    }

    async fn is_online(&self, endpoint: &Endpoint) -> bool {
        self.network
            .peers
            .read()
            .get(endpoint)
            .map(|peer| peer.online)
            .unwrap_or(false)
    }
}
