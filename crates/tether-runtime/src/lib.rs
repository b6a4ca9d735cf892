//! High-level runtime composing the pointer space, garbage collector
//! and synchronizer behind one handle.
//!
//! The lower-level crates stay usable on their own; this crate wires
//! them together the way most applications want: one endpoint identity,
//! one transport, one periodic maintenance task.

mod runtime;

pub use runtime::{Runtime, RuntimeConfig};

pub use tether_core::{
    AddressTag, Endpoint, Key, ObserveOptions, PointerError, PointerId, Shape, TrustedPermission,
    Update, UpdateKind, Value,
};
pub use tether_gc::{GcConfig, GcStats};
pub use tether_reactive::{
    CreateOptions, ObserverFlow, Pointer, PointerSpace, PropertyRef, TransformCtx,
};
pub use tether_sync::{
    LoadContext, LoadOutcome, MemoryNetwork, MemoryStore, PointerStore, SyncConfig, SyncStats,
    Transport,
};
