//! Dumping and loading the engine tables, e.g. for an offline warm start.
//!
//! An image only ever carries data the data source has vouched for. Keys held by an in-flight mutation are written
//! with their pre-mutation content: an optimistic update is dumped as the old data, an optimistic removal as the
//! entity it removed, and an optimistic creation not at all. Versions are kept so that nothing a reader saw before a
//! dump can be seen again at a lower version after the load.

use crate::bus::Event;
use crate::engine::notify_waiters;
use crate::engine::Engine;
use crate::error::SourceError;
use crate::error::SyncError;
use crate::query_cache::QueryCacheEntry;
use crate::traits::DataSource;
use crate::types::EntityKey;
use crate::types::EntitySnapshot;
use crate::types::QueryDescriptor;
use crate::types::QueryStatus;
use crate::types::Timestamp;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;
use tracing::info;

/// Bumped whenever the layout of [`EngineImage`] changes.
pub const IMAGE_FORMAT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedQuery {
    pub descriptor:      QueryDescriptor,
    pub result_refs:     Vec<EntityKey>,
    pub status:          QueryStatus,
    pub last_fetched_at: Option<Timestamp>,
    pub error:           Option<SourceError>,
    pub stale_time:      Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineImage<V> {
    pub format:   u32,
    pub entities: Vec<EntitySnapshot<V>>,
    /// Version floors of removed keys.
    pub retired:  Vec<(EntityKey, u64)>,
    pub queries:  Vec<PersistedQuery>,
}

impl<V> EngineImage<V> {
    /// Every query reference must point at an entity of the image.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.format != IMAGE_FORMAT {
            return Err(SyncError::Persistence(format!(
                "unsupported image format {}, expected {IMAGE_FORMAT}",
                self.format
            )));
        }

        let mut keys = HashSet::with_capacity(self.entities.len());
        for snapshot in &self.entities {
            if !keys.insert(&snapshot.key) {
                return Err(SyncError::Persistence(format!("entity {} appears twice", snapshot.key)));
            }
        }

        for query in &self.queries {
            if let Some(orphan) = query.result_refs.iter().find(|k| !keys.contains(k)) {
                return Err(SyncError::Persistence(format!(
                    "query {} references {orphan} which is not in the image",
                    query.descriptor
                )));
            }
        }
        Ok(())
    }
}

impl<DS> Engine<DS>
where
    DS: DataSource,
{
    /// A consistent copy of the tables with all speculative state taken out.
    pub fn image(&self) -> EngineImage<DS::Value> {
        let state = self.inner.state.lock();

        let mut entities = Vec::with_capacity(state.store.len());
        let mut retired = state.store.retired().clone();
        // Optimistically created, so not part of the image.
        let mut speculative = HashSet::new();

        for snapshot in state.store.iter() {
            let mutation = state
                .pending_keys
                .get(&snapshot.key)
                .and_then(|id| state.pending.get(id));
            let Some(mutation) = mutation
            else {
                entities.push(EntitySnapshot {
                    pending_mutation: None,
                    ..snapshot.clone()
                });
                continue;
            };

            match mutation.previous_snapshots.get(&snapshot.key).and_then(Option::as_ref) {
                Some(previous) => entities.push(EntitySnapshot {
                    version: snapshot.version,
                    pending_mutation: None,
                    ..previous.clone()
                }),
                None => {
                    retired.insert(snapshot.key.clone(), snapshot.version);
                    speculative.insert(snapshot.key.clone());
                }
            }
        }

        // Optimistic removals: bring the entities back along with the references they lost.
        let mut reattach: HashMap<QueryDescriptor, Vec<(usize, EntityKey)>> = HashMap::new();
        for mutation in state.pending.values() {
            let removed = mutation
                .optimistic_snapshots
                .iter()
                .filter(|(_, optimistic)| optimistic.is_none())
                .map(|(key, _)| key);
            for key in removed {
                if let Some(Some(previous)) = mutation.previous_snapshots.get(key) {
                    let version = retired.remove(key).unwrap_or(previous.version);
                    entities.push(EntitySnapshot {
                        version,
                        pending_mutation: None,
                        ..previous.clone()
                    });
                }
            }
            for (key, descriptor, position) in mutation.detached.iter().rev() {
                reattach
                    .entry(descriptor.clone())
                    .or_default()
                    .push((*position, key.clone()));
            }
        }

        let queries = state
            .queries
            .entries()
            .map(|entry| {
                let mut result_refs = entry
                    .result_refs()
                    .iter()
                    .filter(|k| !speculative.contains(*k))
                    .cloned()
                    .collect::<Vec<_>>();
                for (position, key) in reattach.get(entry.descriptor()).into_iter().flatten() {
                    if !result_refs.contains(key) {
                        result_refs.insert((*position).min(result_refs.len()), key.clone());
                    }
                }

                let status = match entry.status() {
                    QueryStatus::Fetching if entry.last_fetched_at().is_some() => QueryStatus::Stale,
                    QueryStatus::Fetching => QueryStatus::Idle,
                    other => other,
                };

                PersistedQuery {
                    descriptor: entry.descriptor().clone(),
                    result_refs,
                    status,
                    last_fetched_at: entry.last_fetched_at(),
                    error: entry.error().map(|err| match err.source_error() {
                        Some(source) => source.clone(),
                        None => SourceError::Unknown(err.to_string()),
                    }),
                    stale_time: entry.stale_time(),
                }
            })
            .collect::<Vec<_>>();

        let mut image = EngineImage {
            format: IMAGE_FORMAT,
            entities,
            retired: retired.into_iter().collect(),
            queries,
        };
        image.entities.sort_by(|a, b| a.key.cmp(&b.key));
        image.retired.sort();
        image.queries.sort_by(|a, b| a.descriptor.cmp(&b.descriptor));
        image
    }

    /// Replace the tables with `image`. Refused while a mutation is in flight or a query is observed. Fetches in
    /// flight are cancelled.
    pub fn restore_image(&self, image: EngineImage<DS::Value>) -> Result<(), SyncError> {
        image.validate()?;

        let (waiters, loaded) = self.with_state(|state, events| {
            if !state.pending.is_empty() {
                return Err(SyncError::Persistence(format!(
                    "{} mutation(s) in flight",
                    state.pending.len()
                )));
            }
            if let Some(entry) = state.queries.observed().next() {
                return Err(SyncError::Persistence(format!(
                    "query {} is being observed",
                    entry.descriptor()
                )));
            }

            let mut waiters = Vec::new();
            for (descriptor, fetch) in state.fetches.drain() {
                debug!("[{}] cancelling fetch #{} of {descriptor} for a load", self.name(), fetch.id);
                waiters.extend(fetch.waiters);
            }

            let EngineImage {
                entities,
                retired,
                queries,
                ..
            } = image;

            let loaded_keys = entities.iter().map(|s| s.key.clone()).collect::<HashSet<_>>();
            let dropped = state
                .store
                .iter()
                .filter(|s| !loaded_keys.contains(&s.key))
                .map(|s| (s.key.clone(), s.version))
                .collect::<Vec<_>>();

            let entries = queries
                .into_iter()
                .map(|q| {
                    let status = match q.status {
                        QueryStatus::Fetching => QueryStatus::Stale,
                        other => other,
                    };
                    QueryCacheEntry::restored(
                        q.descriptor,
                        q.result_refs,
                        status,
                        q.last_fetched_at,
                        q.error.map(SyncError::Source),
                        q.stale_time,
                    )
                })
                .collect::<Vec<_>>();
            let descriptors = entries.iter().map(|e| e.descriptor().clone()).collect::<Vec<_>>();

            state.store.replace(entities, retired.into_iter().collect());
            state.queries.replace(entries);

            for (key, version) in dropped {
                events.push(Event::EntityRemoved { key, version });
            }
            let mut snapshots = state.store.iter().cloned().collect::<Vec<_>>();
            snapshots.sort_by(|a, b| a.key.cmp(&b.key));
            let loaded = snapshots.len();
            events.extend(snapshots.into_iter().map(Event::EntityChanged));
            for descriptor in &descriptors {
                state.push_query_updated(descriptor, events);
            }

            Ok((waiters, loaded))
        })?;

        notify_waiters(waiters, Err(SyncError::Cancelled));
        info!("[{}] loaded {loaded} entit(y/ies)", self.name());
        self.start_sweeper();
        Ok(())
    }
}

impl<DS> Engine<DS>
where
    DS: DataSource,
    DS::Value: Serialize,
{
    pub fn dump(&self) -> Result<Vec<u8>, SyncError> {
        Ok(postcard::to_allocvec(&self.image())?)
    }
}

impl<DS> Engine<DS>
where
    DS: DataSource,
    DS::Value: DeserializeOwned,
{
    pub fn load(&self, blob: &[u8]) -> Result<(), SyncError> {
        let image: EngineImage<DS::Value> = postcard::from_bytes(blob)?;
        self.restore_image(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: u32, version: u64) -> EntitySnapshot<String> {
        EntitySnapshot {
            key: EntityKey::new("todos", id),
            data: format!("todo {id}"),
            version,
            origin: crate::types::Origin::Confirmed,
            last_fetched_at: None,
            last_mutated_at: None,
            pending_mutation: None,
        }
    }

    fn query(refs: Vec<EntityKey>) -> PersistedQuery {
        PersistedQuery {
            descriptor: QueryDescriptor::new(["todos"]),
            result_refs: refs,
            status: QueryStatus::Fresh,
            last_fetched_at: None,
            error: None,
            stale_time: Duration::from_secs(30),
        }
    }

    #[test]
    fn orphan_refs_are_rejected() {
        let image = EngineImage {
            format:   IMAGE_FORMAT,
            entities: vec![snapshot(1, 1)],
            retired:  vec![],
            queries:  vec![query(vec![EntityKey::new("todos", 1), EntityKey::new("todos", 2)])],
        };
        assert!(matches!(image.validate(), Err(SyncError::Persistence(_))));
    }

    #[test]
    fn format_and_duplicates_are_checked() {
        let mut image = EngineImage {
            format:   IMAGE_FORMAT,
            entities: vec![snapshot(1, 1)],
            retired:  vec![],
            queries:  vec![query(vec![EntityKey::new("todos", 1)])],
        };
        assert!(image.validate().is_ok());

        image.entities.push(snapshot(1, 2));
        assert!(image.validate().is_err());

        image.entities.pop();
        image.format = IMAGE_FORMAT + 1;
        assert!(image.validate().is_err());
    }
}
