use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fmt::Display;
use std::time::Duration;

/// Wall-clock time. Survives [`Engine::dump()`](crate::Engine::dump) unlike `Instant`.
pub type Timestamp = DateTime<Utc>;

/// Address of a single entity: the collection it belongs to and its id within that collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    collection: String,
    id:         String,
}

impl EntityKey {
    pub fn new<C: Into<String>, I: ToString>(collection: C, id: I) -> Self {
        Self {
            collection: collection.into(),
            id:         id.to_string(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Where a write came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// Speculative local write, not yet acknowledged by the data source.
    Optimistic,
    /// Data the data source vouches for: fetched, acknowledged, or restored by a rollback.
    Confirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MutationId(pub u64);

impl Display for MutationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "m#{}", self.0)
    }
}

/// A versioned copy of an entity as held by the entity store.
///
/// Callers only ever get owned clones; the store's own copy can't be reached from outside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot<V> {
    pub key:              EntityKey,
    pub data:             V,
    /// Grows by one on every accepted write, rollbacks included.
    pub version:          u64,
    pub origin:           Origin,
    pub last_fetched_at:  Option<Timestamp>,
    pub last_mutated_at:  Option<Timestamp>,
    /// The mutation currently holding this key in its optimistic phase.
    #[serde(skip)]
    pub pending_mutation: Option<MutationId>,
}

impl<V> EntitySnapshot<V> {
    #[inline]
    pub fn is_optimistic(&self) -> bool {
        self.origin == Origin::Optimistic
    }
}

/// One primitive part of a query key or a parameter value.
///
/// Floats are deliberately absent: descriptors must hash and compare structurally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QueryPart {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<&str> for QueryPart {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for QueryPart {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<bool> for QueryPart {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for QueryPart {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for QueryPart {
    fn from(value: i32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<u32> for QueryPart {
    fn from(value: u32) -> Self {
        Self::Int(value as i64)
    }
}

impl<T: Into<QueryPart>> From<Option<T>> for QueryPart {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl Display for QueryPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// A logical query: an ordered key plus named parameters.
///
/// Two descriptors built from the same parts address the same cache slot regardless of the order the
/// parameters were added in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryDescriptor {
    key:    Vec<QueryPart>,
    params: BTreeMap<String, QueryPart>,
}

impl QueryDescriptor {
    pub fn new<I, P>(key: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<QueryPart>,
    {
        Self {
            key:    key.into_iter().map(Into::into).collect(),
            params: BTreeMap::new(),
        }
    }

    pub fn param<N: Into<String>, P: Into<QueryPart>>(mut self, name: N, value: P) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn key(&self) -> &[QueryPart] {
        &self.key
    }

    pub fn params(&self) -> &BTreeMap<String, QueryPart> {
        &self.params
    }

    /// True if this descriptor's key begins with `prefix`. An empty prefix matches everything.
    pub fn starts_with(&self, prefix: &[QueryPart]) -> bool {
        self.key.starts_with(prefix)
    }

    /// Canonical serialized form. Identical logical queries always produce the same string.
    pub fn hash_key(&self) -> String {
        // Neither a Vec nor a BTreeMap with string keys can fail to serialize.
        serde_json::to_string(self).unwrap_or_else(|_| self.to_string())
    }
}

impl Display for QueryDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, part) in self.key.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{part}")?;
        }
        if !self.params.is_empty() {
            write!(f, "; ")?;
            for (i, (name, value)) in self.params.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{name}={value}")?;
            }
        }
        write!(f, "]")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryStatus {
    /// Registered but never fetched.
    Idle,
    Fetching,
    /// Last known result is still servable but is due for a refetch.
    Stale,
    Fresh,
    Error,
}

/// Per-query tuning. Whatever is left as `None` falls back to the engine configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub stale_time: Option<Duration>,
}

impl QueryOptions {
    pub fn stale_time(stale_time: Duration) -> Self {
        Self {
            stale_time: Some(stale_time),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_equality_is_structural() {
        let a = QueryDescriptor::new(["todos"]).param("page", 1).param("done", false);
        let b = QueryDescriptor::new(["todos"]).param("done", false).param("page", 1);
        assert_eq!(a, b);
        assert_eq!(a.hash_key(), b.hash_key());
        assert_ne!(a, QueryDescriptor::new(["todos"]).param("page", 2).param("done", false));
    }

    #[test]
    fn descriptor_prefix() {
        let d = QueryDescriptor::new(vec![QueryPart::from("todos"), QueryPart::from(7)]);
        assert!(d.starts_with(&[QueryPart::from("todos")]));
        assert!(d.starts_with(&[]));
        assert!(!d.starts_with(&[QueryPart::from("users")]));
        assert_eq!(d.to_string(), "[\"todos\", 7]");
    }

    #[test]
    fn entity_key_display() {
        assert_eq!(EntityKey::new("todos", 1).to_string(), "todos/1");
    }
}
