//! Notification bus between the cache tables and whoever watches them.
//!
//! Publishing is synchronous and ordered: callbacks of a topic run in subscription order, once per event, and events
//! are delivered in the order they were queued. The engine queues events while it still holds its table lock, so
//! queue order is the order of state transitions. An event published from inside a callback is appended to the queue
//! and delivered by the drain loop already running, after the current callback returns.
//!
//! Only one drain runs at a time. When two threads publish concurrently, the one that finds a drain in progress returns
//! right away and its events are delivered by the other thread. On a multi-threaded runtime an engine call may
//! therefore return before its subscribers have been called, and those callbacks may run on another thread. Order is
//! still the queue order.

use crate::error::SyncError;
use crate::types::EntityKey;
use crate::types::EntitySnapshot;
use crate::types::MutationId;
use crate::types::QueryDescriptor;
use crate::types::QueryStatus;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Entity(EntityKey),
    Query(QueryDescriptor),
    /// Lifecycle of every mutation.
    Mutations,
    /// Every terminal failure, whatever it came from.
    Errors,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationPhase {
    Optimistic,
    Committed,
    RolledBack(SyncError),
    Vanished(SyncError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event<V> {
    EntityChanged(EntitySnapshot<V>),
    EntityRemoved {
        key:     EntityKey,
        version: u64,
    },
    /// The entry's status or the entities it materializes have changed.
    QueryUpdated {
        descriptor: QueryDescriptor,
        status:     QueryStatus,
    },
    Mutation {
        id:    MutationId,
        keys:  Vec<EntityKey>,
        phase: MutationPhase,
    },
    FetchFailed {
        descriptor: QueryDescriptor,
        error:      SyncError,
    },
}

impl<V> Event<V> {
    pub fn topics(&self) -> Vec<Topic> {
        match self {
            Self::EntityChanged(snapshot) => vec![Topic::Entity(snapshot.key.clone())],
            Self::EntityRemoved { key, .. } => vec![Topic::Entity(key.clone())],
            Self::QueryUpdated { descriptor, .. } => vec![Topic::Query(descriptor.clone())],
            Self::Mutation { phase, .. } => match phase {
                MutationPhase::RolledBack(_) | MutationPhase::Vanished(_) => vec![Topic::Mutations, Topic::Errors],
                _ => vec![Topic::Mutations],
            },
            Self::FetchFailed { descriptor, .. } => vec![Topic::Query(descriptor.clone()), Topic::Errors],
        }
    }
}

pub type Callback<V> = Arc<dyn Fn(&Event<V>) + Send + Sync>;

struct BusInner<V> {
    subscribers: RwLock<HashMap<Topic, Vec<(u64, Callback<V>)>>>,
    next_id:     AtomicU64,
    queue:       Mutex<VecDeque<Event<V>>>,
    // Held by whichever thread is delivering the queue.
    draining:    Mutex<()>,
}

pub struct NotificationBus<V> {
    inner: Arc<BusInner<V>>,
}

impl<V> Clone for NotificationBus<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Default for NotificationBus<V>
where
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> NotificationBus<V>
where
    V: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                next_id:     AtomicU64::new(1),
                queue:       Mutex::new(VecDeque::new()),
                draining:    Mutex::new(()),
            }),
        }
    }

    pub fn subscribe<F>(&self, topic: Topic, callback: F) -> Subscription
    where
        F: Fn(&Event<V>) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .write()
            .entry(topic.clone())
            .or_default()
            .push((id, Arc::new(callback)));

        let bus: Weak<BusInner<V>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(bus) = bus.upgrade() {
                    let mut subscribers = bus.subscribers.write();
                    if let Some(list) = subscribers.get_mut(&topic) {
                        list.retain(|(sid, _)| *sid != id);
                        if list.is_empty() {
                            subscribers.remove(&topic);
                        }
                    }
                }
            })),
        }
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.inner.subscribers.read().get(topic).map_or(0, Vec::len)
    }

    pub fn publish(&self, event: Event<V>) {
        self.enqueue([event]);
        self.drain();
    }

    pub(crate) fn enqueue<I>(&self, events: I)
    where
        I: IntoIterator<Item = Event<V>>,
    {
        self.inner.queue.lock().extend(events);
    }

    /// Deliver everything queued so far. A no-op if another drain is in progress, be it on another thread or further
    /// up the stack of this one; that drain picks up what we queued.
    pub(crate) fn drain(&self) {
        loop {
            let Some(guard) = self.inner.draining.try_lock()
            else {
                return;
            };

            loop {
                let next = self.inner.queue.lock().pop_front();
                let Some(event) = next
                else {
                    break;
                };
                self.dispatch(&event);
            }

            drop(guard);

            // Something could have been queued between the last pop and the release of the guard.
            if self.inner.queue.lock().is_empty() {
                return;
            }
        }
    }

    fn dispatch(&self, event: &Event<V>) {
        for topic in event.topics() {
            // Work on a copy of the list so callbacks are free to (un)subscribe.
            let callbacks = self
                .inner
                .subscribers
                .read()
                .get(&topic)
                .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect::<Vec<_>>())
                .unwrap_or_default();

            for callback in callbacks {
                callback(event);
            }
        }
    }
}

/// Keeps a subscription alive. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the callback registered for as long as the bus lives.
    pub fn detach(mut self) {
        self.cancel.take();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn removed(id: u32, version: u64) -> Event<String> {
        Event::EntityRemoved {
            key: EntityKey::new("todos", id),
            version,
        }
    }

    fn topic(id: u32) -> Topic {
        Topic::Entity(EntityKey::new("todos", id))
    }

    #[test]
    fn callbacks_run_in_subscription_order() {
        let bus = NotificationBus::<String>::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let subs = (0..3)
            .map(|n| {
                let log = Arc::clone(&log);
                bus.subscribe(topic(1), move |_| log.lock().push(n))
            })
            .collect::<Vec<_>>();

        bus.publish(removed(1, 1));
        bus.publish(removed(2, 1));
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        drop(subs);
        assert_eq!(bus.subscriber_count(&topic(1)), 0);
    }

    #[test]
    fn unsubscribing_from_a_callback_spares_the_others() {
        let bus = NotificationBus::<String>::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let first = {
            let slot = Arc::clone(&slot);
            let hits = Arc::clone(&hits);
            bus.subscribe(topic(1), move |_| {
                hits.lock().push("first");
                if let Some(sub) = slot.lock().take() {
                    sub.unsubscribe();
                }
            })
        };
        let second = {
            let hits = Arc::clone(&hits);
            bus.subscribe(topic(1), move |_| hits.lock().push("second"))
        };
        *slot.lock() = Some(second);

        bus.publish(removed(1, 1));
        bus.publish(removed(1, 2));
        assert_eq!(*hits.lock(), vec!["first", "second", "first"]);
        first.unsubscribe();
    }

    #[test]
    fn reentrant_publish_is_delivered_after_the_current_event() {
        let bus = NotificationBus::<String>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let _outer = {
            let bus2 = bus.clone();
            let seen = Arc::clone(&seen);
            bus.subscribe(topic(1), move |ev| {
                if let Event::EntityRemoved { version, .. } = ev {
                    seen.lock().push(format!("outer:{version}"));
                    if *version == 1 {
                        bus2.publish(removed(1, 2));
                        seen.lock().push("outer:after-publish".to_string());
                    }
                }
            })
        };

        bus.publish(removed(1, 1));
        assert_eq!(*seen.lock(), vec!["outer:1", "outer:after-publish", "outer:2"]);
    }

    #[test]
    fn failures_also_go_to_the_error_topic() {
        let bus = NotificationBus::<String>::new();
        let errors = Arc::new(Mutex::new(0));
        let _sub = {
            let errors = Arc::clone(&errors);
            bus.subscribe(Topic::Errors, move |_| *errors.lock() += 1)
        };

        bus.publish(Event::Mutation {
            id:    MutationId(1),
            keys:  vec![],
            phase: MutationPhase::Committed,
        });
        bus.publish(Event::Mutation {
            id:    MutationId(2),
            keys:  vec![],
            phase: MutationPhase::RolledBack(SyncError::Cancelled),
        });
        assert_eq!(*errors.lock(), 1);
    }
}
