use crate::bus::Event;
use crate::bus::NotificationBus;
use crate::bus::Subscription;
use crate::bus::Topic;
use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::mutation::KeyLocks;
use crate::mutation::PendingMutation;
use crate::query_cache::QueryCache;
use crate::query_handle::QueryView;
use crate::scheduler::InFlightFetch;
use crate::store::EntityStore;
use crate::traits::DataSource;
use crate::types::EntityKey;
use crate::types::EntitySnapshot;
use crate::types::MutationId;
use crate::types::Origin;
use crate::types::QueryDescriptor;
use crate::types::Timestamp;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;

// Everything that has to change atomically lives here, behind a single lock. No method of this struct awaits.
pub(crate) struct EngineState<V> {
    pub(crate) store:        EntityStore<V>,
    pub(crate) queries:      QueryCache,
    pub(crate) fetches:      HashMap<QueryDescriptor, InFlightFetch>,
    pub(crate) pending:      HashMap<MutationId, PendingMutation<V>>,
    pub(crate) pending_keys: HashMap<EntityKey, MutationId>,
    pub(crate) next_fetch:   u64,
    pub(crate) next_mutation: u64,
}

impl<V> EngineState<V>
where
    V: Clone + PartialEq,
{
    fn new(config: &EngineConfig) -> Self {
        Self {
            store:         EntityStore::new(),
            queries:       QueryCache::new(
                &config.name(),
                config.stale_time(),
                config.gc_time(),
                config.max_retained_queries(),
            ),
            fetches:       HashMap::new(),
            pending:       HashMap::new(),
            pending_keys:  HashMap::new(),
            next_fetch:    0,
            next_mutation: 0,
        }
    }

    pub(crate) fn put_entity(
        &mut self,
        key: EntityKey,
        data: V,
        origin: Origin,
        now: Timestamp,
        events: &mut Vec<Event<V>>,
    ) -> EntitySnapshot<V> {
        let outcome = self.store.put(key, data, origin, now);
        self.publish_put(outcome.snapshot.clone(), outcome.changed, events);
        outcome.snapshot
    }

    /// Announce a snapshot the store has just accepted. A change of data makes every query referencing the key stale.
    pub(crate) fn publish_put(&mut self, snapshot: EntitySnapshot<V>, changed: bool, events: &mut Vec<Event<V>>) {
        let key = snapshot.key.clone();
        events.push(Event::EntityChanged(snapshot));
        if changed {
            self.touch_queries(&key, events);
        }
    }

    pub(crate) fn remove_entity(
        &mut self,
        key: &EntityKey,
        events: &mut Vec<Event<V>>,
    ) -> Option<(EntitySnapshot<V>, Vec<(QueryDescriptor, usize)>)> {
        let removed = self.store.remove(key)?;
        let detached = self.queries.detach_key(key);
        events.push(Event::EntityRemoved {
            key:     key.clone(),
            version: removed.version,
        });
        for (descriptor, _) in &detached {
            self.queries.mark_stale(descriptor);
            self.push_query_updated(descriptor, events);
        }
        Some((removed, detached))
    }

    fn touch_queries(&mut self, key: &EntityKey, events: &mut Vec<Event<V>>) {
        for descriptor in self.queries.referencing(key) {
            self.queries.mark_stale(&descriptor);
            self.push_query_updated(&descriptor, events);
        }
    }

    pub(crate) fn push_query_updated(&self, descriptor: &QueryDescriptor, events: &mut Vec<Event<V>>) {
        if let Some(entry) = self.queries.lookup(descriptor) {
            events.push(Event::QueryUpdated {
                descriptor: descriptor.clone(),
                status:     entry.status(),
            });
        }
    }

    pub(crate) fn view(&self, descriptor: &QueryDescriptor) -> Option<QueryView<V>> {
        self.queries
            .lookup(descriptor)
            .map(|entry| QueryView::materialize(entry, &self.store))
    }
}

pub(crate) struct EngineInner<DS>
where
    DS: DataSource,
{
    pub(crate) name:      String,
    pub(crate) source:    Arc<DS>,
    pub(crate) config:    EngineConfig,
    pub(crate) state:     Mutex<EngineState<DS::Value>>,
    pub(crate) bus:       NotificationBus<DS::Value>,
    pub(crate) key_locks: KeyLocks,
    pub(crate) sweeper:   Mutex<Option<JoinHandle<()>>>,
    pub(crate) closed:    AtomicBool,
}

/// The cache engine. A cheap-to-clone handle; all clones share the same tables.
///
/// ```ignore
/// let engine = Engine::new(MySource::new(), EngineConfig::standard());
///
/// let mut todos = engine.query(query_key!["todos"]);
/// let view = todos.settled().await;
///
/// engine
///     .mutate(
///         [EntityKey::new("todos", 1)],
///         |_, old| old.map(|t| Todo { done: true, ..t.clone() }),
///         TodoOp::Complete(1),
///         MutationOptions::default(),
///     )
///     .await?;
/// ```
pub struct Engine<DS>
where
    DS: DataSource,
{
    pub(crate) inner: Arc<EngineInner<DS>>,
}

impl<DS> Clone for Engine<DS>
where
    DS: DataSource,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<DS> Debug for Engine<DS>
where
    DS: DataSource,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Engine")
            .field("name", &self.inner.name)
            .field("entities", &state.store.len())
            .field("queries", &state.queries.len())
            .field("fetches", &state.fetches.len())
            .field("mutations", &state.pending.len())
            .finish()
    }
}

impl<DS> Engine<DS>
where
    DS: DataSource,
{
    pub fn new<S: Into<Arc<DS>>>(source: S, config: EngineConfig) -> Self {
        let state = EngineState::new(&config);
        Self {
            inner: Arc::new(EngineInner {
                name: config.name(),
                source: source.into(),
                state: Mutex::new(state),
                bus: NotificationBus::new(),
                key_locks: KeyLocks::default(),
                sweeper: Mutex::new(None),
                closed: AtomicBool::new(false),
                config,
            }),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    #[inline]
    pub fn source(&self) -> Arc<DS> {
        Arc::clone(&self.inner.source)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Run `f` under the table lock. Events it collects are queued before the lock is released and delivered right
    /// after, so subscribers see them in transition order and are free to call back into the engine.
    pub(crate) fn with_state<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut EngineState<DS::Value>, &mut Vec<Event<DS::Value>>) -> R,
    {
        let mut events = Vec::new();
        let result = {
            let mut state = self.inner.state.lock();
            let result = f(&mut state, &mut events);
            self.inner.bus.enqueue(events);
            result
        };
        self.inner.bus.drain();
        result
    }

    /// A copy of the entity's current snapshot.
    pub fn get(&self, key: &EntityKey) -> Option<EntitySnapshot<DS::Value>> {
        self.inner.state.lock().store.get(key).cloned()
    }

    /// Write an entity directly. Returns the new version.
    pub fn put(&self, key: EntityKey, data: DS::Value, origin: Origin) -> u64 {
        let now = Utc::now();
        self.with_state(|state, events| state.put_entity(key, data, origin, now, events).version)
    }

    /// Drop an entity along with every reference to it from the query cache.
    pub fn remove(&self, key: &EntityKey) -> bool {
        self.with_state(|state, events| state.remove_entity(key, events).is_some())
    }

    /// Deep copies of the current snapshots of `keys`; `None` for keys the store doesn't have.
    pub fn snapshot_for(&self, keys: &[EntityKey]) -> HashMap<EntityKey, Option<EntitySnapshot<DS::Value>>> {
        self.inner.state.lock().store.snapshot_for(keys)
    }

    /// The cached state of a query, without observing it or triggering anything.
    pub fn lookup(&self, descriptor: &QueryDescriptor) -> Option<QueryView<DS::Value>> {
        self.inner.state.lock().view(descriptor)
    }

    pub fn subscribe<F>(&self, topic: Topic, callback: F) -> Subscription
    where
        F: Fn(&Event<DS::Value>) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(topic, callback)
    }

    pub fn bus(&self) -> &NotificationBus<DS::Value> {
        &self.inner.bus
    }

    pub fn entity_count(&self) -> usize {
        self.inner.state.lock().store.len()
    }

    pub fn query_count(&self) -> usize {
        self.inner.state.lock().queries.len()
    }

    pub fn pending_mutations(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Stop background work. Fetches in flight are cancelled; mutations already past their optimistic step still run
    /// to commit or rollback. New queries and mutations are refused.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("[{}] Closing engine", self.name());

        if let Some(sweeper) = self.inner.sweeper.lock().take() {
            sweeper.abort();
        }

        let waiters = self.with_state(|state, events| {
            let fetches = state.fetches.drain().collect::<Vec<_>>();
            let mut waiters = Vec::new();
            for (descriptor, fetch) in fetches {
                state.queries.fetch_cancelled(&descriptor);
                state.push_query_updated(&descriptor, events);
                waiters.extend(fetch.waiters);
            }
            waiters
        });
        notify_waiters(waiters, Err(SyncError::Cancelled));
    }
}

pub(crate) fn notify_waiters(waiters: Vec<oneshot::Sender<Result<(), SyncError>>>, result: Result<(), SyncError>) {
    for waiter in waiters {
        // The waiter may have given up already.
        let _ = waiter.send(result.clone());
    }
}

impl<DS> Drop for EngineInner<DS>
where
    DS: DataSource,
{
    fn drop(&mut self) {
        debug!("[{}] Engine dropped", self.name);
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}
