use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;

use crate::error::SourceError;
use crate::types::EntityKey;
use crate::types::QueryDescriptor;

/// What a successful fetch hands back: the query result in order, as `(key, data)` pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult<V> {
    pub items: Vec<(EntityKey, V)>,
}

impl<V> FetchResult<V> {
    pub fn new(items: Vec<(EntityKey, V)>) -> Self {
        Self { items }
    }
}

/// Authoritative data returned by a successful write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult<V> {
    pub entities: HashMap<EntityKey, V>,
    /// Keys the server deleted as part of the operation.
    pub removed:  Vec<EntityKey>,
}

impl<V> WriteResult<V> {
    pub fn new() -> Self {
        Self {
            entities: HashMap::new(),
            removed:  Vec::new(),
        }
    }

    pub fn with_entity(mut self, key: EntityKey, data: V) -> Self {
        self.entities.insert(key, data);
        self
    }

    pub fn with_removed(mut self, key: EntityKey) -> Self {
        self.removed.push(key);
        self
    }
}

impl<V> Default for WriteResult<V> {
    fn default() -> Self {
        Self::new()
    }
}

// For types in charge of talking to whatever owns the data.
#[async_trait]
pub trait DataSource: Sized + Send + Sync + 'static {
    /// Entity payload. `PartialEq` lets the engine tell a real change from a refetch of the same data.
    type Value: Debug + Clone + PartialEq + Send + Sync + 'static;
    /// Opaque write request handed to [`write()`](DataSource::write). Must be reusable across retries.
    type Operation: Debug + Send + Sync + 'static;

    async fn fetch(&self, descriptor: &QueryDescriptor) -> Result<FetchResult<Self::Value>, SourceError>;

    async fn write(&self, operation: &Self::Operation) -> Result<WriteResult<Self::Value>, SourceError>;
}
