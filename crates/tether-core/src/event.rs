//! Update events and wire operations.
//!
//! [`Update`] is the in-process event delivered to observers after a
//! mutation passes the gateway. [`UpdateOp`] is the serialized operation
//! forwarded to subscribers and the origin.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::value::{Key, Value};

/// Kind of change reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateKind {
    /// Value initialized for the first time.
    Init,
    /// Whole value replaced.
    Update,
    /// Property overwritten.
    Set,
    /// Property removed by key.
    Delete,
    /// All entries removed.
    Clear,
    /// Element appended.
    Add,
    /// Element removed by value.
    Remove,
    /// Emitted before an element is dropped by a compound operation.
    BeforeDelete,
    /// Emitted before an element is removed by value.
    BeforeRemove,
}

/// Identifier shared by all events of one atomic compound operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId(u64);

static NEXT_BATCH: AtomicU64 = AtomicU64::new(1);

impl BatchId {
    pub fn next() -> BatchId {
        BatchId(NEXT_BATCH.fetch_add(1, Ordering::Relaxed))
    }
}

/// One change event, delivered to observers after the shadow write.
#[derive(Debug, Clone)]
pub struct Update {
    pub kind: UpdateKind,
    /// Property key, absent for whole-value and append/remove events.
    pub key: Option<Key>,
    /// New value, absent for deletions.
    pub value: Option<Value>,
    /// Previous value where one existed.
    pub previous: Option<Value>,
    /// True when the change was produced by a transform re-evaluation.
    pub is_transform: bool,
    /// True when the change happened inside a referenced child pointer
    /// and is being republished on the parent.
    pub is_child_update: bool,
    /// Set when the event belongs to an atomic compound operation.
    pub batch: Option<BatchId>,
}

impl Update {
    pub fn new(kind: UpdateKind) -> Update {
        Update {
            kind,
            key: None,
            value: None,
            previous: None,
            is_transform: false,
            is_child_update: false,
            batch: None,
        }
    }
}

/// Filters applied to an observer registration.
#[derive(Debug, Clone)]
pub struct ObserveOptions {
    /// Restrict delivery to these kinds. `None` delivers everything.
    pub kinds: Option<Vec<UpdateKind>>,
    /// Skip events produced by transform re-evaluations.
    pub ignore_transforms: bool,
    /// Deliver child-pointer updates republished on this pointer.
    pub recursive: bool,
}

impl Default for ObserveOptions {
    fn default() -> ObserveOptions {
        ObserveOptions {
            kinds: None,
            ignore_transforms: false,
            recursive: true,
        }
    }
}

impl ObserveOptions {
    pub fn delivers(&self, update: &Update) -> bool {
        if update.is_child_update && !self.recursive {
            return false;
        }
        if update.is_transform && self.ignore_transforms {
            return false;
        }
        match &self.kinds {
            Some(kinds) => kinds.contains(&update.kind),
            None => true,
        }
    }
}

/// Serialized mutation forwarded between endpoints. Splice operations are
/// encoded as minimal edits rather than whole-value replacements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateOp {
    Replace { value: Value },
    Set { key: Key, value: Value },
    Delete { key: Key },
    Clear,
    Add { value: Value },
    Remove { value: Value },
    SpliceDelete { start: usize, count: usize },
    SpliceInsert { start: usize, delete_count: usize, values: Vec<Value> },
}

impl UpdateOp {
    /// Stable name used as the coalescing identifier by the update
    /// scheduler: later ops with the same identifier supersede earlier
    /// ones, so only key-addressed ops get one.
    pub fn coalesce_identifier(&self) -> Option<String> {
        match self {
            UpdateOp::Replace { .. } => Some("replace".to_string()),
            UpdateOp::Set { key, .. } => Some(format!("set:{key}")),
            UpdateOp::Delete { key } => Some(format!("delete:{key}")),
            UpdateOp::Clear => Some("clear".to_string()),
            UpdateOp::Add { .. }
            | UpdateOp::Remove { .. }
            | UpdateOp::SpliceDelete { .. }
            | UpdateOp::SpliceInsert { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_ids_unique() {
        assert_ne!(BatchId::next(), BatchId::next());
    }

    #[test]
    fn test_kind_filter() {
        let options = ObserveOptions {
            kinds: Some(vec![UpdateKind::Set]),
            ..Default::default()
        };
        assert!(options.delivers(&Update::new(UpdateKind::Set)));
        assert!(!options.delivers(&Update::new(UpdateKind::Delete)));
    }

    #[test]
    fn test_transform_filter() {
        let options = ObserveOptions {
            ignore_transforms: true,
            ..Default::default()
        };
        let mut update = Update::new(UpdateKind::Update);
        update.is_transform = true;
        assert!(!options.delivers(&update));
        assert!(ObserveOptions::default().delivers(&update));
    }

    #[test]
    fn test_child_update_filter() {
        let mut update = Update::new(UpdateKind::Set);
        update.is_child_update = true;
        assert!(ObserveOptions::default().delivers(&update));
        let options = ObserveOptions {
            recursive: false,
            ..Default::default()
        };
        assert!(!options.delivers(&update));
    }

    #[test]
    fn test_coalesce_identifiers() {
        let set = UpdateOp::Set {
            key: Key::from("a"),
            value: Value::Int(1),
        };
        assert_eq!(set.coalesce_identifier(), Some("set:a".to_string()));
        let splice = UpdateOp::SpliceDelete { start: 0, count: 1 };
        assert_eq!(splice.coalesce_identifier(), None);
    }
}
