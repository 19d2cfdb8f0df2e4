#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use swr_cache::prelude::*;
use swr_cache::test::init_tracing;
use swr_cache::test::ScriptedSource;

pub type Source = ScriptedSource<String>;

pub fn key(id: u32) -> EntityKey {
    EntityKey::new("todos", id)
}

pub fn todos() -> QueryDescriptor {
    query_key!["todos"]
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(2, Duration::from_millis(5))
}

pub fn config() -> swr_cache::config::EngineConfigBuilder {
    EngineConfig::builder()
        .name("test".to_string())
        .fetch_retry(fast_retry())
        .mutation_retry(fast_retry())
}

pub fn engine(source: &Arc<Source>) -> Engine<Source> {
    engine_with(source, config().build().unwrap())
}

pub fn engine_with(source: &Arc<Source>, config: EngineConfig) -> Engine<Source> {
    init_tracing();
    Engine::new(Arc::clone(source), config)
}

/// A table of `n` todos named after their ids, registered as the answer to `todos()`.
pub fn seed_table(source: &Source, ids: &[u32]) -> Vec<(EntityKey, String)> {
    let items = ids
        .iter()
        .map(|id| (key(*id), format!("todo {id}")))
        .collect::<Vec<_>>();
    source.set_table(todos(), items.clone());
    items
}

pub async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Collects every event published on `topic`.
pub struct Recorder {
    pub events:    Arc<Mutex<Vec<Event<String>>>>,
    _subscription: Subscription,
}

impl Recorder {
    pub fn new(engine: &Engine<Source>, topic: Topic) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let _subscription = {
            let events = Arc::clone(&events);
            engine.subscribe(topic, move |ev| events.lock().push(ev.clone()))
        };
        Self { events, _subscription }
    }

    pub fn events(&self) -> Vec<Event<String>> {
        self.events.lock().clone()
    }

    pub fn phases(&self) -> Vec<MutationPhase> {
        self.events
            .lock()
            .iter()
            .filter_map(|ev| match ev {
                Event::Mutation { phase, .. } => Some(phase.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn versions(&self) -> Vec<u64> {
        self.events
            .lock()
            .iter()
            .map(|ev| match ev {
                Event::EntityChanged(snapshot) => snapshot.version,
                Event::EntityRemoved { version, .. } => *version,
                _ => 0,
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<QueryStatus> {
        self.events
            .lock()
            .iter()
            .filter_map(|ev| match ev {
                Event::QueryUpdated { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }
}
