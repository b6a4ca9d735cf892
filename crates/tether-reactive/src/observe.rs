//! Observer registrations and delivery ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tether_core::{Key, ObserveOptions, Update};

/// What an observer wants to happen to its registration after a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverFlow {
    Continue,
    /// Remove the registration once delivery returns.
    Stop,
}

/// Observer callback. Runs outside the pointer's locks, so handlers may
/// read the pointer but must not mutate it (the gateway rejects the
/// re-entrant write).
pub type ObserveHandler = Arc<dyn Fn(&Update) -> ObserverFlow + Send + Sync>;

/// Handle for removing a single observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Groups registrations owned by one logical holder so they can be torn
/// down together when the holder goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerToken(u64);

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

impl OwnerToken {
    pub fn next() -> OwnerToken {
        OwnerToken(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }
}

struct Registration {
    id: ObserverId,
    owner: Option<OwnerToken>,
    options: ObserveOptions,
    handler: ObserveHandler,
}

/// Observers attached to one pointer. Keyed observers are delivered
/// before general observers for a matching event.
#[derive(Default)]
pub struct ObserverSet {
    next_id: u64,
    keyed: HashMap<Key, Vec<Registration>>,
    general: Vec<Registration>,
}

impl ObserverSet {
    pub fn insert(
        &mut self,
        key: Option<Key>,
        owner: Option<OwnerToken>,
        options: ObserveOptions,
        handler: ObserveHandler,
    ) -> ObserverId {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        let registration = Registration {
            id,
            owner,
            options,
            handler,
        };
        match key {
            Some(key) => self.keyed.entry(key).or_default().push(registration),
            None => self.general.push(registration),
        }
        id
    }

    pub fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.len();
        self.general.retain(|r| r.id != id);
        for entries in self.keyed.values_mut() {
            entries.retain(|r| r.id != id);
        }
        self.keyed.retain(|_, entries| !entries.is_empty());
        self.len() != before
    }

    pub fn remove_owner(&mut self, owner: OwnerToken) -> usize {
        let before = self.len();
        self.general.retain(|r| r.owner != Some(owner));
        for entries in self.keyed.values_mut() {
            entries.retain(|r| r.owner != Some(owner));
        }
        self.keyed.retain(|_, entries| !entries.is_empty());
        before - self.len()
    }

    pub fn clear(&mut self) {
        self.keyed.clear();
        self.general.clear();
    }

    pub fn len(&self) -> usize {
        self.general.len() + self.keyed.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handlers eligible for `update`, keyed observers first. Handlers
    /// are cloned out so delivery can happen with no lock held.
    pub fn matching(&self, update: &Update) -> Vec<(ObserverId, ObserveHandler)> {
        let mut out = Vec::new();
        if let Some(key) = &update.key {
            if let Some(entries) = self.keyed.get(key) {
                for r in entries {
                    if r.options.delivers(update) {
                        out.push((r.id, Arc::clone(&r.handler)));
                    }
                }
            }
        }
        for r in &self.general {
            if r.options.delivers(update) {
                out.push((r.id, Arc::clone(&r.handler)));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::UpdateKind;

    fn handler() -> ObserveHandler {
        Arc::new(|_| ObserverFlow::Continue)
    }

    fn set_update(key: &str) -> Update {
        let mut update = Update::new(UpdateKind::Set);
        update.key = Some(Key::from(key));
        update
    }

    #[test]
    fn test_keyed_before_general() {
        let mut set = ObserverSet::default();
        let general = set.insert(None, None, ObserveOptions::default(), handler());
        let keyed = set.insert(
            Some(Key::from("a")),
            None,
            ObserveOptions::default(),
            handler(),
        );
        let order: Vec<ObserverId> = set
            .matching(&set_update("a"))
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(order, vec![keyed, general]);
    }

    #[test]
    fn test_keyed_not_called_for_other_key() {
        let mut set = ObserverSet::default();
        set.insert(
            Some(Key::from("a")),
            None,
            ObserveOptions::default(),
            handler(),
        );
        assert!(set.matching(&set_update("b")).is_empty());
    }

    #[test]
    fn test_remove_by_owner() {
        let mut set = ObserverSet::default();
        let owner = OwnerToken::next();
        set.insert(None, Some(owner), ObserveOptions::default(), handler());
        set.insert(
            Some(Key::from("a")),
            Some(owner),
            ObserveOptions::default(),
            handler(),
        );
        set.insert(None, None, ObserveOptions::default(), handler());
        assert_eq!(set.remove_owner(owner), 2);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_remove_by_id() {
        let mut set = ObserverSet::default();
        let id = set.insert(None, None, ObserveOptions::default(), handler());
        assert!(set.remove(id));
        assert!(!set.remove(id));
        assert!(set.is_empty());
    }
}
