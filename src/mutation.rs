//! Optimistic writes with a rollback guarantee.
//!
//! A mutation goes `Optimistic -> Committed | RolledBack`. The optimistic step is synchronous: snapshots of the target
//! keys are captured and the speculative values are written under the same table lock. The only suspension point is
//! the data source write, which runs on a spawned task so that a caller losing interest can't leave speculative data
//! behind.
//!
//! Mutations sharing a key are serialized: each key has a FIFO lock and a mutation holds the locks of all its keys, in
//! key order, from before its optimistic step until it has committed or rolled back.

use crate::bus::Event;
use crate::bus::MutationPhase;
use crate::config::RetryPolicy;
use crate::engine::Engine;
use crate::error::SourceError;
use crate::error::SyncError;
use crate::traits::DataSource;
use crate::traits::WriteResult;
use crate::types::EntityKey;
use crate::types::EntitySnapshot;
use crate::types::MutationId;
use crate::types::Origin;
use crate::types::QueryDescriptor;
use chrono::Utc;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

/// What to do when the data source reports a conflict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictStrategy {
    #[default]
    Rollback,
    /// Roll back, then refetch every query showing one of the target keys.
    RollbackAndRevalidate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationOptions {
    /// Falls back to [`EngineConfig::mutation_retry`](crate::config::EngineConfig::mutation_retry) when `None`.
    pub retry:       Option<RetryPolicy>,
    pub on_conflict: ConflictStrategy,
}

impl MutationOptions {
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn on_conflict(mut self, strategy: ConflictStrategy) -> Self {
        self.on_conflict = strategy;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Pending,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone)]
pub(crate) struct PendingMutation<V> {
    pub(crate) target_keys:          Vec<EntityKey>,
    // `None` for keys the store didn't have: rolling back means removing them.
    pub(crate) previous_snapshots:   HashMap<EntityKey, Option<EntitySnapshot<V>>>,
    // `None` for keys the mutation removed.
    pub(crate) optimistic_snapshots: HashMap<EntityKey, Option<EntitySnapshot<V>>>,
    pub(crate) status:               MutationStatus,
    // Query references dropped by optimistic removals, in the order they were dropped.
    pub(crate) detached:             Vec<(EntityKey, QueryDescriptor, usize)>,
}

/// A committed mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome<V> {
    pub id:        MutationId,
    /// Confirmed snapshots of every key the commit wrote.
    pub snapshots: HashMap<EntityKey, EntitySnapshot<V>>,
    /// Keys the commit removed.
    pub removed:   Vec<EntityKey>,
    pub attempts:  u32,
}

impl<V> MutationOutcome<V> {
    pub fn get(&self, key: &EntityKey) -> Option<&EntitySnapshot<V>> {
        self.snapshots.get(key)
    }
}

type KeyLock = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug, Default)]
pub(crate) struct KeyLocks {
    locks: Arc<parking_lot::Mutex<HashMap<EntityKey, KeyLock>>>,
}

impl KeyLocks {
    /// `keys` must be sorted, which makes any two acquisitions take shared keys in the same order.
    pub(crate) async fn acquire(&self, keys: &[EntityKey]) -> KeyGuards {
        let mut held = KeyGuards {
            guards: Vec::with_capacity(keys.len()),
            keys:   keys.to_vec(),
            locks:  Arc::clone(&self.locks),
        };
        for key in keys {
            let lock = Arc::clone(self.locks.lock().entry(key.clone()).or_default());
            held.guards.push(lock.lock_owned().await);
        }
        held
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

pub(crate) struct KeyGuards {
    guards: Vec<OwnedMutexGuard<()>>,
    keys:   Vec<EntityKey>,
    locks:  Arc<parking_lot::Mutex<HashMap<EntityKey, KeyLock>>>,
}

impl Drop for KeyGuards {
    fn drop(&mut self) {
        self.guards.clear();
        let mut locks = self.locks.lock();
        for key in &self.keys {
            // Nobody else holds or waits on the lock.
            if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(key);
            }
        }
    }
}

impl<DS> Engine<DS>
where
    DS: DataSource,
{
    /// Apply `transform` to `keys` optimistically, send `operation` to the data source, and commit or roll back
    /// depending on the outcome.
    ///
    /// `transform` gets each target key with its current data, if any, and returns the speculative data or `None` to
    /// remove the entity. It runs once per key, under the table lock, so it must not call back into the engine.
    ///
    /// Waits for every earlier mutation sharing a key with this one. Dropping the future while it waits cancels the
    /// mutation; once the optimistic values are in place the mutation always runs to completion.
    pub async fn mutate<I, F>(
        &self,
        keys: I,
        transform: F,
        operation: DS::Operation,
        options: MutationOptions,
    ) -> Result<MutationOutcome<DS::Value>, SyncError>
    where
        I: IntoIterator<Item = EntityKey>,
        F: FnMut(&EntityKey, Option<&DS::Value>) -> Option<DS::Value> + Send,
    {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }

        let mut keys = keys.into_iter().collect::<Vec<_>>();
        keys.sort();
        keys.dedup();

        let guards = self.inner.key_locks.acquire(&keys).await;
        if self.is_closed() {
            return Err(SyncError::Closed);
        }

        let id = self.apply_optimistic(&keys, transform)?;

        let engine = self.clone();
        let policy = options.retry.unwrap_or_else(|| self.config().mutation_retry());
        tokio::spawn(async move {
            let _guards = guards;
            let remote = tokio::spawn({
                let engine = engine.clone();
                async move { engine.run_mutation(id, operation, policy, options.on_conflict).await }
            });
            match remote.await {
                Ok(outcome) => outcome,
                // The key locks are still held here, so nothing can slip in before the speculative data is gone.
                Err(err) => {
                    error!("[{}] mutation {id} remote phase failed: {err}", engine.name());
                    Err(engine.rollback(id, SourceError::Unknown(format!("remote phase failed: {err}")), 0))
                }
            }
        })
        .await
        .map_err(|err| SyncError::invariant(format!("mutation {id} task failed: {err}")))?
    }

    fn apply_optimistic<F>(&self, keys: &[EntityKey], mut transform: F) -> Result<MutationId, SyncError>
    where
        F: FnMut(&EntityKey, Option<&DS::Value>) -> Option<DS::Value>,
    {
        let now = Utc::now();
        self.with_state(|state, events| {
            if let Some((key, holder)) = keys.iter().find_map(|k| state.pending_keys.get(k).map(|m| (k, *m))) {
                return Err(SyncError::invariant(format!("{key} is still held by mutation {holder}")));
            }

            let previous_snapshots = state.store.snapshot_for(keys);
            // All speculative values first: a transform blowing up must leave the tables untouched.
            let speculative = keys
                .iter()
                .map(|key| {
                    let current = previous_snapshots
                        .get(key)
                        .and_then(Option::as_ref)
                        .map(|snapshot| &snapshot.data);
                    transform(key, current)
                })
                .collect::<Vec<_>>();

            state.next_mutation += 1;
            let id = MutationId(state.next_mutation);
            let mut optimistic_snapshots = HashMap::with_capacity(keys.len());
            let mut detached = Vec::new();

            for (key, data) in keys.iter().zip(speculative) {
                match data {
                    Some(data) => {
                        let outcome = state.store.put(key.clone(), data, Origin::Optimistic, now);
                        state.store.set_pending(key, Some(id));
                        let mut snapshot = outcome.snapshot;
                        snapshot.pending_mutation = Some(id);
                        optimistic_snapshots.insert(key.clone(), Some(snapshot.clone()));
                        state.publish_put(snapshot, outcome.changed, events);
                    }
                    None => {
                        if let Some((_, refs)) = state.remove_entity(key, events) {
                            detached.extend(refs.into_iter().map(|(d, pos)| (key.clone(), d, pos)));
                        }
                        optimistic_snapshots.insert(key.clone(), None);
                    }
                }
                state.pending_keys.insert(key.clone(), id);
            }

            state.pending.insert(
                id,
                PendingMutation {
                    target_keys: keys.to_vec(),
                    previous_snapshots,
                    optimistic_snapshots,
                    status: MutationStatus::Pending,
                    detached,
                },
            );
            events.push(Event::Mutation {
                id,
                keys: keys.to_vec(),
                phase: MutationPhase::Optimistic,
            });

            debug!("[{}] mutation {id} applied optimistically to {} key(s)", self.name(), keys.len());
            Ok(id)
        })
    }

    async fn run_mutation(
        self,
        id: MutationId,
        operation: DS::Operation,
        policy: RetryPolicy,
        on_conflict: ConflictStrategy,
    ) -> Result<MutationOutcome<DS::Value>, SyncError> {
        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            match self.inner.source.write(&operation).await {
                Err(err) if err.is_retryable() && attempts < policy.max_attempts() => {
                    let backoff = policy.backoff(attempts - 1);
                    warn!(
                        "[{}] mutation {id} write failed (attempt {attempts}), retrying in {backoff:?}: {err}",
                        self.name()
                    );
                    tokio::time::sleep(backoff).await;
                }
                other => break other,
            }
        };

        match outcome {
            Ok(response) => self.commit(id, response, attempts),
            Err(SourceError::NotFound(detail)) => Err(self.vanish(id, detail)),
            Err(cause) => {
                let conflict = matches!(cause, SourceError::Conflict(_));
                let err = self.rollback(id, cause, attempts);
                if conflict && on_conflict == ConflictStrategy::RollbackAndRevalidate {
                    if let SyncError::RolledBack { keys, .. } = &err {
                        self.revalidate_referencing(keys);
                    }
                }
                Err(err)
            }
        }
    }

    fn commit(
        &self,
        id: MutationId,
        response: WriteResult<DS::Value>,
        attempts: u32,
    ) -> Result<MutationOutcome<DS::Value>, SyncError> {
        let now = Utc::now();
        self.with_state(|state, events| {
            let mut pending = state
                .pending
                .remove(&id)
                .ok_or_else(|| SyncError::invariant(format!("commit of unknown mutation {id}")))?;
            for key in &pending.target_keys {
                state.pending_keys.remove(key);
                state.store.set_pending(key, None);
            }

            let WriteResult { mut entities, removed } = response;
            let mut snapshots = HashMap::with_capacity(pending.target_keys.len());

            for key in &pending.target_keys {
                if let Some(data) = entities.remove(key) {
                    let snapshot = state.put_entity(key.clone(), data, Origin::Confirmed, now, events);
                    snapshots.insert(key.clone(), snapshot);
                }
                else if !removed.contains(key) {
                    // Acknowledged without data: the speculative value becomes the accepted one.
                    if let Some(Some(optimistic)) = pending.optimistic_snapshots.remove(key) {
                        let snapshot = state.put_entity(key.clone(), optimistic.data, Origin::Confirmed, now, events);
                        snapshots.insert(key.clone(), snapshot);
                    }
                }
            }

            let mut extra = entities.into_iter().collect::<Vec<_>>();
            extra.sort_by(|a, b| a.0.cmp(&b.0));
            for (key, data) in extra {
                let snapshot = state.put_entity(key.clone(), data, Origin::Confirmed, now, events);
                snapshots.insert(key, snapshot);
            }

            for key in &removed {
                state.remove_entity(key, events);
            }

            pending.status = MutationStatus::Committed;
            events.push(Event::Mutation {
                id,
                keys: pending.target_keys.clone(),
                phase: MutationPhase::Committed,
            });
            debug!("[{}] mutation {id} {:?} after {attempts} attempt(s)", self.name(), pending.status);

            Ok(MutationOutcome {
                id,
                snapshots,
                removed,
                attempts,
            })
        })
    }

    // Always produces an error: the rollback report, or an invariant violation if there is nothing to roll back to.
    fn rollback(&self, id: MutationId, cause: SourceError, attempts: u32) -> SyncError {
        self.with_state(|state, events| {
            let Some(pending) = state.pending.get(&id)
            else {
                return SyncError::invariant(format!("rollback of unknown mutation {id}"));
            };
            if let Some(key) = pending
                .target_keys
                .iter()
                .find(|k| !pending.previous_snapshots.contains_key(*k))
            {
                return SyncError::invariant(format!("mutation {id} has no snapshot of {key} to roll back to"));
            }
            let Some(mut pending) = state.pending.remove(&id)
            else {
                return SyncError::invariant(format!("rollback of unknown mutation {id}"));
            };

            for key in &pending.target_keys {
                state.pending_keys.remove(key);
                state.store.set_pending(key, None);
            }

            for key in &pending.target_keys {
                match pending.previous_snapshots.get(key).and_then(Option::as_ref) {
                    Some(previous) => {
                        let outcome = state.store.restore(previous);
                        state.publish_put(outcome.snapshot, outcome.changed, events);
                    }
                    None => {
                        state.remove_entity(key, events);
                    }
                }
            }

            for (key, descriptor, position) in pending.detached.iter().rev() {
                if state.store.contains(key) && state.queries.reattach_key(descriptor, *position, key.clone()) {
                    state.push_query_updated(descriptor, events);
                }
            }

            pending.status = MutationStatus::RolledBack;
            warn!("[{}] mutation {id} {:?} after {attempts} attempt(s): {cause}", self.name(), pending.status);

            let err = SyncError::RolledBack {
                mutation_id: id,
                keys: pending.target_keys.clone(),
                cause,
                attempts,
            };
            events.push(Event::Mutation {
                id,
                keys: pending.target_keys,
                phase: MutationPhase::RolledBack(err.clone()),
            });
            err
        })
    }

    // The data source says the targets are gone: drop them instead of restoring what we had.
    fn vanish(&self, id: MutationId, detail: String) -> SyncError {
        self.with_state(|state, events| {
            let Some(pending) = state.pending.remove(&id)
            else {
                return SyncError::invariant(format!("mutation {id} vanished while not pending"));
            };

            for key in &pending.target_keys {
                state.pending_keys.remove(key);
                state.store.set_pending(key, None);
                state.remove_entity(key, events);
            }

            info!("[{}] mutation {id} targets vanished: {detail}", self.name());
            let err = SyncError::Vanished {
                mutation_id: id,
                keys: pending.target_keys.clone(),
                detail,
            };
            events.push(Event::Mutation {
                id,
                keys: pending.target_keys,
                phase: MutationPhase::Vanished(err.clone()),
            });
            err
        })
    }

    fn revalidate_referencing(&self, keys: &[EntityKey]) {
        let referencing = {
            let state = self.inner.state.lock();
            keys.iter()
                .flat_map(|key| state.queries.referencing(key))
                .collect::<HashSet<_>>()
        };
        if !referencing.is_empty() {
            self.invalidate_matching(|d| referencing.contains(d));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(id: u32) -> EntityKey {
        EntityKey::new("todos", id)
    }

    #[tokio::test]
    async fn overlapping_acquisitions_queue_up() {
        let locks = KeyLocks::default();
        let first = locks.acquire(&[key(1), key(2)]).await;

        let waiting = {
            let locks = KeyLocks {
                locks: Arc::clone(&locks.locks),
            };
            tokio::spawn(async move {
                let _held = locks.acquire(&[key(2), key(3)]).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        // Disjoint keys don't wait.
        let other = tokio::time::timeout(Duration::from_millis(50), locks.acquire(&[key(4)])).await;
        assert!(other.is_ok());
        drop(other);

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("second acquisition never got through")
            .unwrap();
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn abandoned_acquisition_leaves_nothing_behind() {
        let locks = KeyLocks::default();
        let held = locks.acquire(&[key(1)]).await;
        let attempt = tokio::time::timeout(Duration::from_millis(20), locks.acquire(&[key(1)])).await;
        assert!(attempt.is_err());
        drop(held);
        assert_eq!(locks.len(), 0);
    }

    #[test]
    fn options_builder() {
        let options = MutationOptions::default()
            .retry(RetryPolicy::none())
            .on_conflict(ConflictStrategy::RollbackAndRevalidate);
        assert_eq!(options.retry, Some(RetryPolicy::none()));
        assert_eq!(options.on_conflict, ConflictStrategy::RollbackAndRevalidate);
        assert_eq!(MutationOptions::default().on_conflict, ConflictStrategy::Rollback);
    }
}
