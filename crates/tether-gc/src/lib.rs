//! Garbage collection for the pointer space.
//!
//! The coordinator watches retention events from the space, weakens
//! pointers that lose all retention after a grace window, and finalizes
//! them once their value has been reclaimed. Endpoints the collected
//! pointer was subscribed to are reported so the synchronizer can send
//! the unsubscribe.

mod collector;

pub use collector::{FinalizeDescriptor, GcConfig, GcCoordinator, GcStats};
