//! Decides when cached query results get refetched and keeps at most one fetch per descriptor in flight.
//!
//! Every fetch is tagged with an id. A response is only applied if its id is still the current one for the
//! descriptor; a cancelled or superseded fetch finds its id gone and its result is dropped on arrival.

use crate::bus::Event;
use crate::engine::notify_waiters;
use crate::engine::Engine;
use crate::engine::EngineState;
use crate::error::SourceError;
use crate::error::SyncError;
use crate::query_handle::QueryView;
use crate::traits::DataSource;
use crate::traits::FetchResult;
use crate::types::Origin;
use crate::types::QueryDescriptor;
use crate::types::QueryPart;
use crate::types::QueryStatus;
use chrono::Utc;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

pub(crate) type FetchWaiter = oneshot::Sender<Result<(), SyncError>>;

pub(crate) struct InFlightFetch {
    pub(crate) id:      u64,
    // Imperative fetches waiting for the outcome.
    pub(crate) waiters: Vec<FetchWaiter>,
}

/// Which query entries an invalidation applies to.
#[derive(Clone)]
pub enum QueryFilter {
    All,
    Exact(QueryDescriptor),
    /// Every descriptor whose key starts with these parts.
    Prefix(Vec<QueryPart>),
    Predicate(Arc<dyn Fn(&QueryDescriptor) -> bool + Send + Sync>),
}

impl QueryFilter {
    pub fn prefix<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<QueryPart>,
    {
        Self::Prefix(parts.into_iter().map(Into::into).collect())
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&QueryDescriptor) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    pub fn matches(&self, descriptor: &QueryDescriptor) -> bool {
        match self {
            Self::All => true,
            Self::Exact(d) => d == descriptor,
            Self::Prefix(prefix) => descriptor.starts_with(prefix),
            Self::Predicate(f) => f(descriptor),
        }
    }
}

impl From<QueryDescriptor> for QueryFilter {
    fn from(descriptor: QueryDescriptor) -> Self {
        Self::Exact(descriptor)
    }
}

impl Debug for QueryFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "QueryFilter::All"),
            Self::Exact(d) => f.debug_tuple("QueryFilter::Exact").field(d).finish(),
            Self::Prefix(p) => f.debug_tuple("QueryFilter::Prefix").field(p).finish(),
            Self::Predicate(_) => write!(f, "QueryFilter::Predicate(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Fresh entries that outlived their stale time.
    pub expired: usize,
    /// Unobserved entries dropped from the cache.
    pub evicted: usize,
}

impl<DS> Engine<DS>
where
    DS: DataSource,
{
    /// Start a fetch of `descriptor` unless one is already running; with `restart` a running one is superseded. The
    /// entry must exist.
    pub(crate) fn start_fetch(
        &self,
        state: &mut EngineState<DS::Value>,
        descriptor: &QueryDescriptor,
        restart: bool,
        waiter: Option<FetchWaiter>,
        events: &mut Vec<Event<DS::Value>>,
    ) {
        if let Some(running) = state.fetches.get_mut(descriptor) {
            if !restart {
                debug!("[{}] joining fetch #{} of {descriptor}", self.name(), running.id);
                running.waiters.extend(waiter);
                return;
            }
            debug!("[{}] superseding fetch #{} of {descriptor}", self.name(), running.id);
        }

        let mut waiters = state
            .fetches
            .remove(descriptor)
            .map(|running| running.waiters)
            .unwrap_or_default();
        waiters.extend(waiter);

        state.next_fetch += 1;
        let fetch_id = state.next_fetch;
        state.fetches.insert(descriptor.clone(), InFlightFetch { id: fetch_id, waiters });

        if state.queries.set_fetching(descriptor) != Some(QueryStatus::Fetching) {
            state.push_query_updated(descriptor, events);
        }

        let engine = self.clone();
        let descriptor = descriptor.clone();
        tokio::spawn(async move { engine.run_fetch(descriptor, fetch_id).await });
    }

    #[instrument(
        level = "trace",
        skip(self, descriptor),
        fields(engine = %self.name(), query = %descriptor.hash_key())
    )]
    async fn run_fetch(self, descriptor: QueryDescriptor, fetch_id: u64) {
        let policy = self.config().fetch_retry();
        let mut attempt = 0;

        let outcome = loop {
            attempt += 1;
            match self.inner.source.fetch(&descriptor).await {
                Err(err) if err.is_retryable() && attempt < policy.max_attempts() => {
                    let backoff = policy.backoff(attempt - 1);
                    warn!(
                        "[{}] fetch #{fetch_id} of {descriptor} failed (attempt {attempt}), retrying in {backoff:?}: {err}",
                        self.name()
                    );
                    tokio::time::sleep(backoff).await;
                    if !self.is_current_fetch(&descriptor, fetch_id) {
                        debug!("[{}] fetch #{fetch_id} of {descriptor} was cancelled during backoff", self.name());
                        return;
                    }
                }
                other => break other,
            }
        };

        self.finish_fetch(&descriptor, fetch_id, outcome);
    }

    fn is_current_fetch(&self, descriptor: &QueryDescriptor, fetch_id: u64) -> bool {
        self.inner
            .state
            .lock()
            .fetches
            .get(descriptor)
            .is_some_and(|f| f.id == fetch_id)
    }

    fn finish_fetch(
        &self,
        descriptor: &QueryDescriptor,
        fetch_id: u64,
        outcome: Result<FetchResult<DS::Value>, SourceError>,
    ) {
        let now = Utc::now();
        let (waiters, result) = self.with_state(|state, events| {
            if !state.fetches.get(descriptor).is_some_and(|f| f.id == fetch_id) {
                debug!(
                    "[{}] discarding out-of-date response of fetch #{fetch_id} for {descriptor}",
                    self.name()
                );
                return (Vec::new(), Ok(()));
            }
            let waiters = state
                .fetches
                .remove(descriptor)
                .map(|f| f.waiters)
                .unwrap_or_default();

            let result = match outcome {
                Ok(fetched) => {
                    let mut seen = HashSet::with_capacity(fetched.items.len());
                    let mut keys = Vec::with_capacity(fetched.items.len());
                    for (key, data) in fetched.items {
                        if !seen.insert(key.clone()) {
                            continue;
                        }
                        if state.pending_keys.contains_key(&key) {
                            // Speculative data stays on display until its mutation resolves. An entity optimistically
                            // deleted can't be referenced, though.
                            if state.store.contains(&key) {
                                keys.push(key);
                            }
                            continue;
                        }
                        state.put_entity(key.clone(), data, Origin::Confirmed, now, events);
                        keys.push(key);
                    }
                    debug!("[{}] fetch #{fetch_id} of {descriptor} resolved with {} item(s)", self.name(), keys.len());
                    state.queries.resolve(descriptor, keys, None, now);
                    state.push_query_updated(descriptor, events);
                    Ok(())
                }
                Err(err) => {
                    warn!("[{}] fetch #{fetch_id} of {descriptor} failed: {err}", self.name());
                    let error = SyncError::from(err);
                    state.queries.resolve(descriptor, Vec::new(), Some(error.clone()), now);
                    state.push_query_updated(descriptor, events);
                    events.push(Event::FetchFailed {
                        descriptor: descriptor.clone(),
                        error:      error.clone(),
                    });
                    Err(error)
                }
            };
            (waiters, result)
        });

        notify_waiters(waiters, result);
    }

    /// Fetch `descriptor` and wait for the outcome. A fresh cached result is returned as is; a fetch already in flight
    /// is joined rather than duplicated.
    pub async fn fetch_query(&self, descriptor: QueryDescriptor) -> Result<QueryView<DS::Value>, SyncError> {
        let now = Utc::now();
        let (tx, rx) = oneshot::channel();

        let cached = self.with_state(|state, events| {
            if self.is_closed() {
                return Some(Err(SyncError::Closed));
            }
            let entry = state.queries.ensure(&descriptor, None);
            if entry.status() == QueryStatus::Fresh && !entry.is_expired(now) {
                return state.view(&descriptor).map(Ok);
            }
            self.start_fetch(state, &descriptor, false, Some(tx), events);
            None
        });

        if let Some(cached) = cached {
            return cached;
        }

        rx.await.map_err(|_| SyncError::Cancelled)??;
        self.lookup(&descriptor).ok_or(SyncError::Cancelled)
    }

    /// Abandon the fetch in flight for `descriptor`, if any. Its response is discarded whenever it arrives.
    pub fn cancel_fetch(&self, descriptor: &QueryDescriptor) -> bool {
        let cancelled = self.with_state(|state, events| {
            let fetch = state.fetches.remove(descriptor)?;
            debug!("[{}] cancelled fetch #{} of {descriptor}", self.name(), fetch.id);
            state.queries.fetch_cancelled(descriptor);
            state.push_query_updated(descriptor, events);
            Some(fetch.waiters)
        });

        match cancelled {
            Some(waiters) => {
                notify_waiters(waiters, Err(SyncError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// An observer went away. The last one leaving cancels a fetch that nobody is waiting for any more.
    pub(crate) fn release(&self, descriptor: &QueryDescriptor) {
        self.with_state(|state, events| {
            if state.queries.unregister(descriptor) != Some(0) {
                return;
            }
            if state.fetches.get(descriptor).is_some_and(|f| f.waiters.is_empty()) {
                if let Some(fetch) = state.fetches.remove(descriptor) {
                    debug!("[{}] last observer of {descriptor} left, dropping fetch #{}", self.name(), fetch.id);
                }
                state.queries.fetch_cancelled(descriptor);
                state.push_query_updated(descriptor, events);
            }
        });
    }

    /// Mark matching entries stale. Those observed, or with a fetch in flight, are refetched right away; a running fetch
    /// is superseded since it may predate whatever caused the invalidation. Unobserved ones wait for their next observer.
    ///
    /// Returns the number of matching entries.
    pub fn invalidate(&self, filter: &QueryFilter) -> usize {
        self.invalidate_matching(|d| filter.matches(d))
    }

    pub(crate) fn invalidate_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&QueryDescriptor) -> bool,
    {
        self.with_state(|state, events| {
            let picked = state.queries.mark_stale_where(predicate);
            for (descriptor, transitioned) in &picked {
                if *transitioned {
                    state.push_query_updated(descriptor, events);
                }
                let observed = state.queries.lookup(descriptor).is_some_and(|e| e.observers() > 0);
                if !self.is_closed() && (observed || state.fetches.contains_key(descriptor)) {
                    self.start_fetch(state, descriptor, true, None, events);
                }
            }
            debug!("[{}] invalidated {} query entr(y/ies)", self.name(), picked.len());
            picked.len()
        })
    }

    /// The network came back: refetch everything observed that is stale, failed, or past its stale time.
    pub fn on_reconnect(&self) -> usize {
        info!("[{}] reconnected, revalidating observed queries", self.name());
        self.revalidate_observed()
    }

    /// The application regained focus. Same policy as [`on_reconnect()`](Self::on_reconnect).
    pub fn on_focus(&self) -> usize {
        debug!("[{}] focused, revalidating observed queries", self.name());
        self.revalidate_observed()
    }

    fn revalidate_observed(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        let now = Utc::now();
        self.with_state(|state, events| {
            for descriptor in state.queries.expire(now) {
                state.push_query_updated(&descriptor, events);
            }

            let due = state
                .queries
                .observed()
                .filter(|e| matches!(e.status(), QueryStatus::Stale | QueryStatus::Error | QueryStatus::Idle))
                .map(|e| e.descriptor().clone())
                .collect::<Vec<_>>();

            for descriptor in &due {
                self.start_fetch(state, descriptor, false, None, events);
            }
            due.len()
        })
    }

    /// One round of housekeeping: TTL expiry and eviction of unobserved entries whose grace period is over.
    pub fn sweep(&self) -> SweepReport {
        let now = Utc::now();
        self.with_state(|state, events| {
            let expired = state.queries.expire(now);
            for descriptor in &expired {
                state.push_query_updated(descriptor, events);
            }

            let fetches = &state.fetches;
            let evicted = state.queries.collect_garbage(|d| fetches.contains_key(d));
            if !evicted.is_empty() {
                debug!("[{}] evicted {} unobserved query entr(y/ies)", self.name(), evicted.len());
            }

            SweepReport {
                expired: expired.len(),
                evicted: evicted.len(),
            }
        })
    }

    /// Make sure the background sweeper runs. It stops by itself once the query cache is empty or the engine is gone,
    /// and is started again on demand.
    pub fn start_sweeper(&self) {
        if self.is_closed() || tokio::runtime::Handle::try_current().is_err() {
            return;
        }

        let mut sweeper = self.inner.sweeper.lock();
        if sweeper.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        debug!("[{}] starting sweeper", self.name());
        let engine = Arc::downgrade(&self.inner);
        let interval = self.config().sweep_interval();
        *sweeper = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = engine.upgrade()
                else {
                    break;
                };
                let engine = Engine { inner };
                if engine.is_closed() {
                    break;
                }
                engine.sweep();
                if engine.inner.state.lock().queries.is_empty() {
                    debug!("[{}] stopping sweeper, nothing left to watch", engine.name());
                    break;
                }
            }
        }));
    }
}
