//! The entity store: the one table that owns entity snapshots.
//!
//! The store knows nothing about queries or subscribers; the [`Engine`](crate::Engine) wraps every call into
//! it with invalidation of dependent queries and event publishing.

use crate::types::EntityKey;
use crate::types::EntitySnapshot;
use crate::types::MutationId;
use crate::types::Origin;
use crate::types::Timestamp;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct PutOutcome<V> {
    pub snapshot: EntitySnapshot<V>,
    /// False when the write carried the same data the key already had.
    pub changed:  bool,
}

#[derive(Debug)]
pub struct EntityStore<V> {
    entities: HashMap<EntityKey, EntitySnapshot<V>>,
    // Last version of every removed key. A key coming back continues from there so no reader ever sees its version
    // go down.
    retired:  HashMap<EntityKey, u64>,
}

impl<V> Default for EntityStore<V> {
    fn default() -> Self {
        Self {
            entities: HashMap::new(),
            retired:  HashMap::new(),
        }
    }
}

impl<V> EntityStore<V>
where
    V: Clone + PartialEq,
{
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    #[inline]
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entities.contains_key(key)
    }

    /// Absent is a normal answer, not an error.
    #[inline]
    pub fn get(&self, key: &EntityKey) -> Option<&EntitySnapshot<V>> {
        self.entities.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntitySnapshot<V>> {
        self.entities.values()
    }

    fn next_version(&self, key: &EntityKey) -> u64 {
        let current = self
            .entities
            .get(key)
            .map(|s| s.version)
            .or_else(|| self.retired.get(key).copied())
            .unwrap_or(0);
        current + 1
    }

    pub fn put(&mut self, key: EntityKey, data: V, origin: Origin, now: Timestamp) -> PutOutcome<V> {
        let version = self.next_version(&key);
        let previous = self.entities.remove(&key);
        let changed = previous.as_ref().is_none_or(|p| p.data != data);

        let (last_fetched_at, last_mutated_at, pending_mutation) = match previous {
            Some(p) => (p.last_fetched_at, p.last_mutated_at, p.pending_mutation),
            None => (None, None, None),
        };

        let snapshot = EntitySnapshot {
            key: key.clone(),
            data,
            version,
            origin,
            last_fetched_at: match origin {
                Origin::Confirmed => Some(now),
                Origin::Optimistic => last_fetched_at,
            },
            last_mutated_at: match origin {
                Origin::Optimistic => Some(now),
                Origin::Confirmed => last_mutated_at,
            },
            pending_mutation,
        };

        self.retired.remove(&key);
        self.entities.insert(key, snapshot.clone());
        PutOutcome { snapshot, changed }
    }

    /// Bring back the content of `previous` under a fresh version. Used by rollbacks: data and timestamps are those of
    /// the pre-mutation copy, the version keeps growing.
    pub fn restore(&mut self, previous: &EntitySnapshot<V>) -> PutOutcome<V> {
        let version = self.next_version(&previous.key);
        let current = self.entities.remove(&previous.key);
        let changed = current.as_ref().is_none_or(|c| c.data != previous.data);

        let snapshot = EntitySnapshot {
            key: previous.key.clone(),
            data: previous.data.clone(),
            version,
            origin: Origin::Confirmed,
            last_fetched_at: previous.last_fetched_at,
            last_mutated_at: previous.last_mutated_at,
            pending_mutation: current.and_then(|c| c.pending_mutation),
        };

        self.retired.remove(&previous.key);
        self.entities.insert(previous.key.clone(), snapshot.clone());
        PutOutcome { snapshot, changed }
    }

    pub fn remove(&mut self, key: &EntityKey) -> Option<EntitySnapshot<V>> {
        let removed = self.entities.remove(key)?;
        self.retired.insert(key.clone(), removed.version);
        Some(removed)
    }

    /// Independent deep copies of the current snapshots of `keys`. Keys the store doesn't have map to `None`.
    ///
    /// This is what a rollback restores from, so it must never hand out anything that a later write could reach.
    pub fn snapshot_for<'a, I>(&self, keys: I) -> HashMap<EntityKey, Option<EntitySnapshot<V>>>
    where
        I: IntoIterator<Item = &'a EntityKey>,
    {
        keys.into_iter()
            .map(|k| (k.clone(), self.entities.get(k).cloned()))
            .collect()
    }

    pub(crate) fn set_pending(&mut self, key: &EntityKey, mutation: Option<MutationId>) {
        if let Some(snapshot) = self.entities.get_mut(key) {
            snapshot.pending_mutation = mutation;
        }
    }

    pub(crate) fn retired(&self) -> &HashMap<EntityKey, u64> {
        &self.retired
    }

    // Wholesale replacement, used by `Engine::load()`.
    pub(crate) fn replace(&mut self, entities: Vec<EntitySnapshot<V>>, retired: HashMap<EntityKey, u64>) {
        self.entities = entities.into_iter().map(|s| (s.key.clone(), s)).collect();
        self.retired = retired;
    }
}
