//! Reactive pointer space.
//!
//! This crate implements the local half of the pointer runtime: the
//! registry and identity map, the mutation gateway, observers, property
//! references, derived (transform) pointers and the retention model the
//! collector builds on. Network concerns live in `tether-sync`.

pub mod cell;
pub mod mutation;
pub mod observe;
pub mod pointer;
pub mod property;
mod registry;
pub mod space;
pub mod transform;

pub use cell::{CellId, ValueCell, WeakValueCell};
pub use observe::{ObserveHandler, ObserverFlow, ObserverId, OwnerToken};
pub use pointer::{CreateOptions, Pointer};
pub use property::PropertyRef;
pub use space::{OutboundUpdate, PointerMeta, PointerSpace, SpaceConfig};
pub use transform::{TransformAbort, TransformCtx, TransformFn, TransformOptions};
