//! Core types shared across the Tether pointer runtime.
//!
//! This crate defines the wire-stable building blocks: pointer identifiers
//! and their allocation scheme, endpoint identities, the dynamic value
//! model, structural shapes for property validation, and the update event
//! vocabulary emitted by the mutation gateway.

pub mod endpoint;
pub mod error;
pub mod event;
pub mod id;
pub mod shape;
pub mod value;

pub use endpoint::{Endpoint, TrustedPermission};
pub use error::PointerError;
pub use event::{BatchId, ObserveOptions, Update, UpdateKind, UpdateOp};
pub use id::{AddressTag, IdAllocator, PointerId, FINGERPRINT_LEN, POINTER_ID_LEN};
pub use shape::Shape;
pub use value::{Key, Value, ValueKind};
