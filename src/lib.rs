//! # swr-cache
//!
//! In-process, stale-while-revalidate cache of server-owned entities with optimistic mutations and guaranteed
//! rollback.
//!
//! Think of it as the client-side half of a data layer: a keyed table of entity snapshots, a cache of query results
//! pointing into that table, and a coordinator that lets you show a write before the server has acknowledged it.
//!
//! # The Basics
//!
//! The crate is designed for the following use case:
//!
//! - Some remote party owns the data; you talk to it through a [`DataSource`] implementation.
//! - Reads are expressed as queries: an ordered key plus parameters, answered with an ordered list of entities.
//! - Writes should be visible immediately and reverted cleanly if the remote side refuses them.
//!
//! The engine operates on the following principles:
//!
//! - Entities are stored once, no matter how many query results they appear in. A query result is a list of
//!   [`EntityKey`](types::EntityKey)s.
//! - Every accepted write bumps the entity version. Versions never go down, rollbacks included.
//! - Stale data stays servable while it is being refetched.
//! - At most one fetch per query descriptor is in flight; late responses of superseded fetches are discarded.
//! - Mutations sharing a key are serialized; disjoint mutations run concurrently.
//! - Every change is published on a synchronous, ordered [notification bus](bus::NotificationBus).
//! - It is an explicit value, not a global: create as many engines as you like.
//!
//! # Mutations
//!
//! [`Engine::mutate()`] captures deep copies of the target entities, writes the speculative values tagged
//! [`Origin::Optimistic`](types::Origin::Optimistic), and sends the operation to the data source. Network errors are
//! retried with bounded exponential backoff. The mutation then either commits, replacing the speculative values with
//! the server's, or rolls back to the captured copies. There is no third way out: once the optimistic step has run,
//! the mutation completes even if the caller stops waiting for it.
//!
//! # Queries
//!
//! [`Engine::query()`] returns a [`QueryHandle`](query_handle::QueryHandle) that serves the cached result right away
//! and yields updated views as a stream. Unobserved entries are kept for a grace period and then evicted by a
//! background sweeper.

pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod mutation;
pub mod persist;
pub mod projection;
pub mod query_cache;
pub mod query_handle;
pub mod scheduler;
pub mod store;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use engine::Engine;
#[doc(inline)]
pub use traits::DataSource;

pub mod prelude {
    pub use crate::bus::Event;
    pub use crate::bus::MutationPhase;
    pub use crate::bus::Subscription;
    pub use crate::bus::Topic;
    pub use crate::config::EngineConfig;
    pub use crate::config::RetryPolicy;
    pub use crate::engine::Engine;
    pub use crate::error::SourceError;
    pub use crate::error::SyncError;
    pub use crate::mutation::ConflictStrategy;
    pub use crate::mutation::MutationOptions;
    pub use crate::mutation::MutationOutcome;
    pub use crate::projection::Equality;
    pub use crate::query_handle::QueryHandle;
    pub use crate::query_handle::QueryView;
    pub use crate::scheduler::QueryFilter;
    pub use crate::traits::DataSource;
    pub use crate::traits::FetchResult;
    pub use crate::traits::WriteResult;
    pub use crate::types::*;
    pub use crate::query_key;
}

/// Build a [`QueryDescriptor`](types::QueryDescriptor): key parts first, then optional `name => value` parameters
/// after a semicolon.
///
/// ```
/// use swr_cache::query_key;
///
/// let page = query_key!["todos"; "page" => 2, "done" => false];
/// assert_eq!(page.key().len(), 1);
/// assert_eq!(page.params().len(), 2);
/// assert_eq!(query_key!["todos", 7].to_string(), "[\"todos\", 7]");
/// ```
#[macro_export]
macro_rules! query_key {
    ($($part:expr),+ ; $($name:expr => $value:expr),* $(,)?) => {
        $crate::types::QueryDescriptor::new(::std::vec![$($crate::types::QueryPart::from($part)),+])
            $(.param($name, $value))*
    };
    ($($part:expr),+ $(,)?) => {
        $crate::types::QueryDescriptor::new(::std::vec![$($crate::types::QueryPart::from($part)),+])
    };
}
