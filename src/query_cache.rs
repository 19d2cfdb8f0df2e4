//! Query results and their freshness, tracked apart from the entities they point to.
//!
//! Every entry keeps an observer count. When it drops to zero the entry is parked in a `moka` cache that acts as a
//! retention clock: once moka lets go of the descriptor, either because `gc_time` has passed or because too many
//! entries are parked, the next [`QueryCache::collect_garbage()`] evicts the entry for real.

use crate::error::SyncError;
use crate::types::EntityKey;
use crate::types::QueryDescriptor;
use crate::types::QueryStatus;
use crate::types::Timestamp;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use std::collections::hash_map;
use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct QueryCacheEntry {
    pub(crate) descriptor:      QueryDescriptor,
    pub(crate) result_refs:     Vec<EntityKey>,
    pub(crate) status:          QueryStatus,
    pub(crate) last_fetched_at: Option<Timestamp>,
    pub(crate) error:           Option<SyncError>,
    pub(crate) observers:       usize,
    pub(crate) stale_time:      Duration,
    // What to go back to if a fetch gets cancelled.
    status_before_fetch:        QueryStatus,
}

impl QueryCacheEntry {
    fn new(descriptor: QueryDescriptor, stale_time: Duration) -> Self {
        Self {
            descriptor,
            result_refs: Vec::new(),
            status: QueryStatus::Idle,
            last_fetched_at: None,
            error: None,
            observers: 0,
            stale_time,
            status_before_fetch: QueryStatus::Idle,
        }
    }

    pub(crate) fn restored(
        descriptor: QueryDescriptor,
        result_refs: Vec<EntityKey>,
        status: QueryStatus,
        last_fetched_at: Option<Timestamp>,
        error: Option<SyncError>,
        stale_time: Duration,
    ) -> Self {
        Self {
            descriptor,
            result_refs,
            status,
            last_fetched_at,
            error,
            observers: 0,
            stale_time,
            status_before_fetch: status,
        }
    }

    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    pub fn result_refs(&self) -> &[EntityKey] {
        &self.result_refs
    }

    pub fn status(&self) -> QueryStatus {
        self.status
    }

    pub fn last_fetched_at(&self) -> Option<Timestamp> {
        self.last_fetched_at
    }

    pub fn error(&self) -> Option<&SyncError> {
        self.error.as_ref()
    }

    pub fn observers(&self) -> usize {
        self.observers
    }

    pub fn stale_time(&self) -> Duration {
        self.stale_time
    }

    /// TTL check: a fresh result older than its stale time is due for a refetch.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.status == QueryStatus::Fresh
            && self.last_fetched_at.is_some_and(|fetched| {
                (now - fetched)
                    .to_std()
                    .map_or(false, |elapsed| elapsed > self.stale_time)
            })
    }

    /// Whether a new observer should kick off a fetch.
    pub(crate) fn needs_fetch(&self, now: Timestamp) -> bool {
        match self.status {
            QueryStatus::Idle | QueryStatus::Stale | QueryStatus::Error => true,
            QueryStatus::Fetching => false,
            QueryStatus::Fresh => self.is_expired(now),
        }
    }
}

pub struct QueryCache {
    entries:            HashMap<QueryDescriptor, QueryCacheEntry>,
    // Which entries hold a reference to an entity.
    referenced_by:      HashMap<EntityKey, HashSet<QueryDescriptor>>,
    unobserved:         HashSet<QueryDescriptor>,
    retention:          Cache<QueryDescriptor, ()>,
    default_stale_time: Duration,
}

impl QueryCache {
    pub fn new(name: &str, default_stale_time: Duration, gc_time: Duration, max_retained: u64) -> Self {
        Self {
            entries: HashMap::new(),
            referenced_by: HashMap::new(),
            unobserved: HashSet::new(),
            retention: Cache::builder()
                .name(name)
                .max_capacity(max_retained)
                .time_to_live(gc_time)
                .eviction_policy(EvictionPolicy::lru())
                .build(),
            default_stale_time,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn lookup(&self, descriptor: &QueryDescriptor) -> Option<&QueryCacheEntry> {
        self.entries.get(descriptor)
    }

    pub fn entries(&self) -> impl Iterator<Item = &QueryCacheEntry> {
        self.entries.values()
    }

    fn entry_mut(
        &mut self,
        descriptor: &QueryDescriptor,
        stale_time: Option<Duration>,
        observed: bool,
    ) -> &mut QueryCacheEntry {
        match self.entries.entry(descriptor.clone()) {
            hash_map::Entry::Occupied(e) => {
                let entry = e.into_mut();
                if let Some(stale_time) = stale_time {
                    entry.stale_time = stale_time;
                }
                entry
            }
            hash_map::Entry::Vacant(e) => {
                if !observed {
                    self.unobserved.insert(descriptor.clone());
                    self.retention.insert(descriptor.clone(), ());
                }
                e.insert(QueryCacheEntry::new(
                    descriptor.clone(),
                    stale_time.unwrap_or(self.default_stale_time),
                ))
            }
        }
    }

    /// Idempotent with respect to the entry: creates an `Idle` one if needed. Every call adds an observer.
    pub fn register(&mut self, descriptor: &QueryDescriptor, stale_time: Option<Duration>) -> &QueryCacheEntry {
        self.unobserved.remove(descriptor);
        self.retention.invalidate(descriptor);
        let entry = self.entry_mut(descriptor, stale_time, true);
        entry.observers += 1;
        entry
    }

    /// Make sure an entry exists without observing it.
    pub fn ensure(&mut self, descriptor: &QueryDescriptor, stale_time: Option<Duration>) -> &QueryCacheEntry {
        self.entry_mut(descriptor, stale_time, false)
    }

    /// Returns the number of observers left, `None` if there is no such entry.
    pub fn unregister(&mut self, descriptor: &QueryDescriptor) -> Option<usize> {
        let entry = self.entries.get_mut(descriptor)?;
        entry.observers = entry.observers.saturating_sub(1);
        let left = entry.observers;
        if left == 0 && self.unobserved.insert(descriptor.clone()) {
            self.retention.insert(descriptor.clone(), ());
        }
        Some(left)
    }

    pub fn observed(&self) -> impl Iterator<Item = &QueryCacheEntry> {
        self.entries.values().filter(|e| e.observers > 0)
    }

    pub fn matching<F>(&self, predicate: F) -> Vec<QueryDescriptor>
    where
        F: Fn(&QueryDescriptor) -> bool,
    {
        self.entries.keys().filter(|d| predicate(*d)).cloned().collect()
    }

    pub fn referencing(&self, key: &EntityKey) -> Vec<QueryDescriptor> {
        self.referenced_by
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the status the entry had before, `None` if there is no entry.
    pub fn set_fetching(&mut self, descriptor: &QueryDescriptor) -> Option<QueryStatus> {
        let entry = self.entries.get_mut(descriptor)?;
        let before = entry.status;
        if before != QueryStatus::Fetching {
            entry.status_before_fetch = before;
            entry.status = QueryStatus::Fetching;
        }
        Some(before)
    }

    /// A fetch was abandoned: put the entry back into the state it was in before the fetch started.
    pub fn fetch_cancelled(&mut self, descriptor: &QueryDescriptor) -> bool {
        let Some(entry) = self.entries.get_mut(descriptor)
        else {
            return false;
        };
        if entry.status != QueryStatus::Fetching {
            return false;
        }
        entry.status = match entry.status_before_fetch {
            QueryStatus::Fresh | QueryStatus::Fetching => QueryStatus::Stale,
            other => other,
        };
        true
    }

    /// Land a fetch outcome. On success `keys` replace the result set; an error keeps the last good one around.
    ///
    /// The caller is responsible for `keys` all being present in the entity store.
    pub fn resolve(
        &mut self,
        descriptor: &QueryDescriptor,
        keys: Vec<EntityKey>,
        error: Option<SyncError>,
        now: Timestamp,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(descriptor)
        else {
            return false;
        };

        entry.last_fetched_at = Some(now);
        match error {
            Some(err) => {
                entry.status = QueryStatus::Error;
                entry.error = Some(err);
            }
            None => {
                entry.status = QueryStatus::Fresh;
                entry.error = None;
                let old_refs = std::mem::replace(&mut entry.result_refs, keys);
                let new_refs = entry.result_refs.clone();
                for key in old_refs {
                    self.unindex(&key, descriptor);
                }
                for key in new_refs {
                    self.referenced_by.entry(key).or_default().insert(descriptor.clone());
                }
            }
        }
        true
    }

    /// Stale-while-revalidate: the result set stays, only the status changes. Returns true on an actual transition.
    pub fn mark_stale(&mut self, descriptor: &QueryDescriptor) -> bool {
        match self.entries.get_mut(descriptor) {
            Some(entry) if matches!(entry.status, QueryStatus::Fresh | QueryStatus::Error) => {
                entry.status = QueryStatus::Stale;
                true
            }
            _ => false,
        }
    }

    /// Returns every entry the predicate picked, each with whether it actually went stale.
    pub fn mark_stale_where<F>(&mut self, predicate: F) -> Vec<(QueryDescriptor, bool)>
    where
        F: Fn(&QueryDescriptor) -> bool,
    {
        self.matching(predicate)
            .into_iter()
            .map(|descriptor| {
                let transitioned = self.mark_stale(&descriptor);
                (descriptor, transitioned)
            })
            .collect()
    }

    /// TTL sweep. Returns the entries that went stale.
    pub fn expire(&mut self, now: Timestamp) -> Vec<QueryDescriptor> {
        let expired = self
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.descriptor.clone())
            .collect::<Vec<_>>();
        for descriptor in &expired {
            self.mark_stale(descriptor);
        }
        expired
    }

    /// Cascade of an entity removal: drop `key` from every result set that has it. Returns where it was.
    pub fn detach_key(&mut self, key: &EntityKey) -> Vec<(QueryDescriptor, usize)> {
        let Some(descriptors) = self.referenced_by.remove(key)
        else {
            return Vec::new();
        };

        let mut detached = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if let Some(entry) = self.entries.get_mut(&descriptor) {
                if let Some(pos) = entry.result_refs.iter().position(|k| k == key) {
                    entry.result_refs.retain(|k| k != key);
                    detached.push((descriptor, pos));
                }
            }
        }
        detached
    }

    /// Undo of [`detach_key()`](Self::detach_key) for a single entry.
    pub fn reattach_key(&mut self, descriptor: &QueryDescriptor, position: usize, key: EntityKey) -> bool {
        let Some(entry) = self.entries.get_mut(descriptor)
        else {
            return false;
        };
        if entry.result_refs.contains(&key) {
            return false;
        }
        let position = position.min(entry.result_refs.len());
        entry.result_refs.insert(position, key.clone());
        self.referenced_by.entry(key).or_default().insert(descriptor.clone());
        true
    }

    /// Evict unobserved entries whose retention has run out. `protected` entries stay regardless; it is meant for
    /// those with a fetch in flight.
    pub fn collect_garbage<F>(&mut self, protected: F) -> Vec<QueryDescriptor>
    where
        F: Fn(&QueryDescriptor) -> bool,
    {
        self.retention.run_pending_tasks();

        let doomed = self
            .unobserved
            .iter()
            .filter(|d| !self.retention.contains_key(*d) && !protected(*d))
            .cloned()
            .collect::<Vec<_>>();

        for descriptor in &doomed {
            self.evict(descriptor);
        }
        doomed
    }

    fn evict(&mut self, descriptor: &QueryDescriptor) {
        self.unobserved.remove(descriptor);
        self.retention.invalidate(descriptor);
        if let Some(entry) = self.entries.remove(descriptor) {
            for key in &entry.result_refs {
                self.unindex(key, descriptor);
            }
        }
    }

    fn unindex(&mut self, key: &EntityKey, descriptor: &QueryDescriptor) {
        if let hash_map::Entry::Occupied(mut e) = self.referenced_by.entry(key.clone()) {
            e.get_mut().remove(descriptor);
            if e.get().is_empty() {
                e.remove();
            }
        }
    }

    // Wholesale replacement, used by `Engine::load()`. All loaded entries start unobserved.
    pub(crate) fn replace(&mut self, entries: Vec<QueryCacheEntry>) {
        self.entries.clear();
        self.referenced_by.clear();
        self.unobserved.clear();
        self.retention.invalidate_all();

        for entry in entries {
            for key in &entry.result_refs {
                self.referenced_by
                    .entry(key.clone())
                    .or_default()
                    .insert(entry.descriptor.clone());
            }
            self.unobserved.insert(entry.descriptor.clone());
            self.retention.insert(entry.descriptor.clone(), ());
            self.entries.insert(entry.descriptor.clone(), entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn cache() -> QueryCache {
        QueryCache::new("test", Duration::from_secs(30), Duration::from_secs(300), 100)
    }

    fn todos() -> QueryDescriptor {
        QueryDescriptor::new(["todos"])
    }

    fn key(id: u32) -> EntityKey {
        EntityKey::new("todos", id)
    }

    #[test]
    fn register_is_idempotent_and_counts_observers() {
        let mut qc = cache();
        assert_eq!(qc.register(&todos(), None).status(), QueryStatus::Idle);
        assert_eq!(qc.register(&todos(), None).observers(), 2);
        assert_eq!(qc.len(), 1);
        assert_eq!(qc.unregister(&todos()), Some(1));
        assert_eq!(qc.unregister(&todos()), Some(0));
        assert_eq!(qc.unregister(&QueryDescriptor::new(["users"])), None);
    }

    #[test]
    fn mark_stale_where_reports_transitions() {
        let mut qc = cache();
        let users = QueryDescriptor::new(["users"]);
        qc.register(&todos(), None);
        qc.register(&users, None);
        qc.set_fetching(&todos());
        qc.resolve(&todos(), vec![key(1)], None, Utc::now());

        let mut picked = qc.mark_stale_where(|_| true);
        picked.sort_by_key(|(d, _)| d.to_string());
        assert_eq!(picked, vec![(todos(), true), (users.clone(), false)]);
        assert_eq!(qc.lookup(&todos()).unwrap().status(), QueryStatus::Stale);
        assert_eq!(qc.lookup(&users).unwrap().status(), QueryStatus::Idle);

        // Already stale: picked again, no transition.
        assert_eq!(qc.mark_stale_where(|d| d == &todos()), vec![(todos(), false)]);
    }

    #[test]
    fn resolve_maintains_reverse_index() {
        let mut qc = cache();
        let now = Utc::now();
        qc.register(&todos(), None);
        qc.set_fetching(&todos());
        qc.resolve(&todos(), vec![key(1), key(2)], None, now);

        let entry = qc.lookup(&todos()).unwrap();
        assert_eq!(entry.status(), QueryStatus::Fresh);
        assert_eq!(entry.result_refs(), &[key(1), key(2)]);
        assert_eq!(qc.referencing(&key(2)), vec![todos()]);

        qc.resolve(&todos(), vec![key(3)], None, now);
        assert!(qc.referencing(&key(1)).is_empty());
        assert_eq!(qc.referencing(&key(3)), vec![todos()]);
    }

    #[test]
    fn stale_keeps_last_known_result() {
        let mut qc = cache();
        qc.register(&todos(), None);
        qc.resolve(&todos(), vec![key(1)], None, Utc::now());

        assert!(qc.mark_stale(&todos()));
        assert!(!qc.mark_stale(&todos()));
        let entry = qc.lookup(&todos()).unwrap();
        assert_eq!(entry.status(), QueryStatus::Stale);
        assert_eq!(entry.result_refs(), &[key(1)]);
    }

    #[test]
    fn error_keeps_last_good_result() {
        let mut qc = cache();
        qc.register(&todos(), None);
        qc.resolve(&todos(), vec![key(1)], None, Utc::now());
        qc.set_fetching(&todos());
        qc.resolve(
            &todos(),
            vec![],
            Some(SyncError::Source(crate::error::SourceError::Network("down".into()))),
            Utc::now(),
        );
        let entry = qc.lookup(&todos()).unwrap();
        assert_eq!(entry.status(), QueryStatus::Error);
        assert_eq!(entry.result_refs(), &[key(1)]);
        assert!(entry.error().is_some());
    }

    #[test]
    fn detach_and_reattach() {
        let mut qc = cache();
        qc.register(&todos(), None);
        qc.resolve(&todos(), vec![key(1), key(2), key(3)], None, Utc::now());

        let detached = qc.detach_key(&key(2));
        assert_eq!(detached, vec![(todos(), 1)]);
        assert_eq!(qc.lookup(&todos()).unwrap().result_refs(), &[key(1), key(3)]);
        assert!(qc.referencing(&key(2)).is_empty());

        assert!(qc.reattach_key(&todos(), 1, key(2)));
        assert_eq!(qc.lookup(&todos()).unwrap().result_refs(), &[key(1), key(2), key(3)]);
        assert_eq!(qc.referencing(&key(2)), vec![todos()]);
    }

    #[test]
    fn cancelled_fetch_restores_status() {
        let mut qc = cache();
        qc.register(&todos(), None);
        assert_eq!(qc.set_fetching(&todos()), Some(QueryStatus::Idle));
        assert!(qc.fetch_cancelled(&todos()));
        assert_eq!(qc.lookup(&todos()).unwrap().status(), QueryStatus::Idle);

        qc.resolve(&todos(), vec![], None, Utc::now());
        qc.set_fetching(&todos());
        qc.fetch_cancelled(&todos());
        assert_eq!(qc.lookup(&todos()).unwrap().status(), QueryStatus::Stale);
    }

    #[test]
    fn ttl_expiry() {
        let mut qc = QueryCache::new("test", Duration::from_secs(10), Duration::from_secs(300), 100);
        let then = Utc::now();
        qc.register(&todos(), None);
        qc.resolve(&todos(), vec![], None, then);

        assert!(qc.expire(then + chrono::Duration::seconds(5)).is_empty());
        assert_eq!(qc.expire(then + chrono::Duration::seconds(11)), vec![todos()]);
        assert_eq!(qc.lookup(&todos()).unwrap().status(), QueryStatus::Stale);
    }

    #[test]
    fn observed_entries_are_never_collected() {
        let mut qc = QueryCache::new("test", Duration::from_secs(30), Duration::from_millis(1), 100);
        let users = QueryDescriptor::new(["users"]);
        qc.register(&todos(), None);
        qc.ensure(&users, None);
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(qc.collect_garbage(|_| false), vec![users.clone()]);
        assert!(qc.lookup(&todos()).is_some());
        assert!(qc.lookup(&users).is_none());
    }

    #[test]
    fn protected_entries_survive_collection() {
        let mut qc = QueryCache::new("test", Duration::from_secs(30), Duration::from_millis(1), 100);
        qc.ensure(&todos(), None);
        std::thread::sleep(Duration::from_millis(20));
        assert!(qc.collect_garbage(|_| true).is_empty());
        assert_eq!(qc.collect_garbage(|_| false), vec![todos()]);
    }
}
