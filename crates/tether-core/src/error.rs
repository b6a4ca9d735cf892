//! Error taxonomy for pointer operations.

use thiserror::Error;

/// Errors surfaced by pointer lifecycle, mutation and sync operations.
///
/// The type is `Clone` so that a single failed load can be fanned out to
/// every caller awaiting the same in-flight resolution.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PointerError {
    /// A value cell is already bound to a different pointer.
    #[error("value is already bound to pointer {0}")]
    DuplicateBinding(String),

    /// A property write violated the pointer's declared shape.
    #[error("invalid property '{key}': {reason}")]
    InvalidProperty { key: String, reason: String },

    /// The requesting endpoint is not in the pointer's access list.
    #[error("endpoint {endpoint} may not access pointer {pointer}")]
    Permission { pointer: String, endpoint: String },

    /// The pointer is sealed against mutation.
    #[error("pointer {0} is sealed")]
    Sealed(String),

    /// No source could produce the pointer's value.
    #[error("pointer {0} could not be resolved")]
    Unresolved(String),

    /// The pointer was reclaimed by the garbage collector.
    #[error("pointer {0} was garbage collected")]
    GarbageCollected(String),

    /// A transform produced no value on its initial evaluation.
    #[error("transform for pointer {0} produced no value")]
    InvalidTransformResult(String),

    /// A mutation was attempted while another mutation on the same
    /// pointer was still being applied.
    #[error("re-entrant mutation on pointer {0}")]
    ReentrantMutation(String),

    /// The pointer exists but its value was never initialized.
    #[error("pointer {0} is not initialized")]
    Uninitialized(String),

    /// A malformed pointer identifier was encountered.
    #[error("invalid pointer id: {0}")]
    InvalidId(String),

    /// A transport-level failure while talking to a remote endpoint.
    #[error("network failure for pointer {pointer}: {reason}")]
    Network { pointer: String, reason: String },
}
