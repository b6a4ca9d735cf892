//! Endpoint-to-endpoint synchronization for the pointer runtime.
//!
//! Resolving remote pointer ids, subscription management with pooling
//! and failover, keep-latest update scheduling, and the transport
//! abstraction the runtime plugs a real network into.

pub mod config;
pub mod loader;
pub mod message;
pub mod pool;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod transport;

pub use config::{SyncConfig, SyncConfigBuilder};
pub use loader::{LazyPointer, LoadContext, LoadOutcome};
pub use message::{PointerUpdate, PointerValue, SyncMessage, SyncResponse};
pub use pool::{PoolConfig, SubscribePool};
pub use scheduler::UpdateScheduler;
pub use store::{MemoryStore, PointerStore};
pub use sync::{SyncStats, Synchronizer};
pub use transport::{MemoryNetwork, MemoryTransport, MessageHandler, Transport, TransportError};
