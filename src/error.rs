use crate::types::EntityKey;
use crate::types::MutationId;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Failures a [`DataSource`](crate::DataSource) reports back to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SourceError {
    /// Transient transport or server trouble. The only kind that is ever retried.
    #[error("network error: {0}")]
    Network(String),
    /// The request was rejected as malformed; the caller has to correct its input.
    #[error("validation error: {0}")]
    Validation(String),
    /// The server state diverged from what the request assumed.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The target vanished on the server side.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("data source error: {0}")]
    Unknown(String),
}

impl SourceError {
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub fn detail(&self) -> &str {
        match self {
            Self::Network(d) | Self::Validation(d) | Self::Conflict(d) | Self::NotFound(d) | Self::Unknown(d) => d,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error(transparent)]
    Source(#[from] SourceError),

    /// The optimistic state of a mutation has been reverted.
    #[error("mutation {mutation_id} rolled back after {attempts} attempt(s): {cause}")]
    RolledBack {
        mutation_id: MutationId,
        keys:        Vec<EntityKey>,
        cause:       SourceError,
        attempts:    u32,
    },

    /// The data source reported the mutation targets gone; they were dropped from the cache.
    #[error("mutation {mutation_id} targets vanished: {detail}")]
    Vanished {
        mutation_id: MutationId,
        keys:        Vec<EntityKey>,
        detail:      String,
    },

    #[error("request cancelled")]
    Cancelled,

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("engine is closed")]
    Closed,
}

impl SyncError {
    /// The data source failure behind this error, if there is one.
    pub fn source_error(&self) -> Option<&SourceError> {
        match self {
            Self::Source(e) | Self::RolledBack { cause: e, .. } => Some(e),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn invariant<S: ToString>(msg: S) -> Self {
        Self::InternalInvariant(msg.to_string())
    }
}

impl From<postcard::Error> for SyncError {
    fn from(err: postcard::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}
