use crate::bus::Subscription;
use crate::bus::Topic;
use crate::engine::Engine;
use crate::error::SyncError;
use crate::query_cache::QueryCacheEntry;
use crate::scheduler::QueryFilter;
use crate::store::EntityStore;
use crate::traits::DataSource;
use crate::types::EntitySnapshot;
use crate::types::QueryDescriptor;
use crate::types::QueryOptions;
use crate::types::QueryStatus;
use crate::types::Timestamp;
use chrono::Utc;
use std::fmt::Debug;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::Stream;
use tokio_stream::StreamExt;

/// A query entry as seen from outside: status plus the referenced entities, resolved at the time of the call.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryView<V> {
    pub descriptor:      QueryDescriptor,
    pub status:          QueryStatus,
    pub items:           Vec<EntitySnapshot<V>>,
    pub last_fetched_at: Option<Timestamp>,
    pub error:           Option<SyncError>,
    pub observers:       usize,
}

impl<V> QueryView<V>
where
    V: Clone + PartialEq,
{
    pub(crate) fn materialize(entry: &QueryCacheEntry, store: &EntityStore<V>) -> Self {
        Self {
            descriptor:      entry.descriptor().clone(),
            status:          entry.status(),
            items:           entry
                .result_refs()
                .iter()
                .filter_map(|key| store.get(key).cloned())
                .collect(),
            last_fetched_at: entry.last_fetched_at(),
            error:           entry.error().cloned(),
            observers:       entry.observers(),
        }
    }

    pub(crate) fn empty(descriptor: QueryDescriptor) -> Self {
        Self {
            descriptor,
            status: QueryStatus::Idle,
            items: Vec::new(),
            last_fetched_at: None,
            error: None,
            observers: 0,
        }
    }

    pub fn data(&self) -> Vec<&V> {
        self.items.iter().map(|s| &s.data).collect()
    }

    /// Nothing is on the way: the view holds whatever the last fetch produced.
    pub fn is_settled(&self) -> bool {
        !matches!(self.status, QueryStatus::Idle | QueryStatus::Fetching)
    }
}

/// An observed query. While it lives the entry can't be evicted; dropping it releases the observation.
///
/// The handle is also a [`Stream`] yielding a fresh [`QueryView`] after every change of the entry. Bursts of changes
/// collapse into one item.
pub struct QueryHandle<DS>
where
    DS: DataSource,
{
    engine:        Engine<DS>,
    descriptor:    QueryDescriptor,
    // Carries a change counter; only the latest value is kept, so an idle handle costs nothing.
    updates:       WatchStream<u64>,
    _subscription: Subscription,
}

impl<DS> QueryHandle<DS>
where
    DS: DataSource,
{
    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    /// The cached state right now, possibly stale.
    pub fn current(&self) -> QueryView<DS::Value> {
        self.engine
            .lookup(&self.descriptor)
            .unwrap_or_else(|| QueryView::empty(self.descriptor.clone()))
    }

    /// Wait for the next change.
    pub async fn changed(&mut self) -> Option<QueryView<DS::Value>> {
        self.updates.next().await?;
        Some(self.current())
    }

    /// Wait until the entry is neither idle nor fetching.
    pub async fn settled(&mut self) -> QueryView<DS::Value> {
        loop {
            let view = self.current();
            if view.is_settled() || self.engine.is_closed() {
                return view;
            }
            if self.changed().await.is_none() {
                return self.current();
            }
        }
    }

    /// Refetch regardless of freshness, superseding a fetch in flight.
    pub fn refetch(&self) {
        self.engine.invalidate(&QueryFilter::Exact(self.descriptor.clone()));
    }
}

impl<DS> Stream for QueryHandle<DS>
where
    DS: DataSource,
{
    type Item = QueryView<DS::Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.updates).poll_next(cx) {
            Poll::Ready(Some(_)) => Poll::Ready(Some(self.current())),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<DS> Debug for QueryHandle<DS>
where
    DS: DataSource,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("engine", &self.engine.name())
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

impl<DS> Drop for QueryHandle<DS>
where
    DS: DataSource,
{
    fn drop(&mut self) {
        self.engine.release(&self.descriptor);
    }
}

impl<DS> Engine<DS>
where
    DS: DataSource,
{
    /// Observe a query. The returned handle serves the cached result right away; if the entry is idle, stale, failed
    /// or past its stale time a background fetch is started.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn query(&self, descriptor: QueryDescriptor) -> QueryHandle<DS> {
        self.query_with(descriptor, QueryOptions::default())
    }

    pub fn query_with(&self, descriptor: QueryDescriptor, options: QueryOptions) -> QueryHandle<DS> {
        let (tx, rx) = watch::channel(0u64);
        // Subscribe before registering so the fetch this may start can't slip by unnoticed.
        let subscription = self.subscribe(Topic::Query(descriptor.clone()), move |_| {
            tx.send_modify(|changes| *changes = changes.wrapping_add(1));
        });

        let now = Utc::now();
        self.with_state(|state, events| {
            let needs_fetch = state.queries.register(&descriptor, options.stale_time).needs_fetch(now);
            if needs_fetch && !self.is_closed() {
                self.start_fetch(state, &descriptor, false, None, events);
            }
        });
        self.start_sweeper();

        QueryHandle {
            engine: self.clone(),
            descriptor,
            updates: WatchStream::from_changes(rx),
            _subscription: subscription,
        }
    }
}
