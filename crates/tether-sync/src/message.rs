//! Wire messages exchanged between endpoints.

use serde::{Deserialize, Serialize};

use tether_core::{PointerId, UpdateOp, Value};

/// A pointer's serialized state, sent in response to a value request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointerValue {
    pub pointer: PointerId,
    pub value: Value,
}

/// One forwarded mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointerUpdate {
    pub pointer: PointerId,
    pub op: UpdateOp,
}

/// Messages an endpoint sends to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Subscribe to updates for a batch of pointers. With `want_value`
    /// the current values are returned in the response.
    Subscribe {
        pointers: Vec<PointerId>,
        want_value: bool,
    },
    Unsubscribe {
        pointers: Vec<PointerId>,
    },
    /// Forwarded mutations, batched per receiver.
    Update {
        updates: Vec<PointerUpdate>,
    },
    /// One-shot value request without subscribing.
    Fetch {
        pointer: PointerId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncResponse {
    Ack,
    Values(Vec<PointerValue>),
    NotFound { pointer: PointerId },
    Denied { pointer: PointerId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{Key, Value};

    #[test]
    fn test_message_serde_round_trip() {
        let update = PointerUpdate {
            pointer: PointerId::ANONYMOUS,
            op: UpdateOp::Set {
                key: Key::from("a"),
                value: Value::Int(1),
            },
        };
        let message = SyncMessage::Update {
            updates: vec![update],
        };
        let json = serde_json::to_string(&message).unwrap();
        let back: SyncMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);
    }
}
