//! Error types for the editor engine

use thiserror::Error;
use vows_common::{CommonError, OwnerIdentity};

/// Failure reported by the persistence service
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("persistence service unavailable: {0}")]
    Unavailable(String),

    #[error("write rejected: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure on the realtime channel
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RealtimeError {
    #[error("subscription rejected: {0}")]
    Rejected(String),

    #[error("realtime channel closed")]
    Closed,
}

/// Failure posting to the rendering surface
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SurfaceError {
    #[error("rendering surface is not attached")]
    Detached,
}

/// Failure of the remote uniqueness lookup
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LookupError {
    #[error("uniqueness lookup failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum SyncError {
    /// Commit's remote write failed; the store has been rolled back
    #[error("changes not saved, check your connection: {source}")]
    Persistence {
        #[source]
        source: PersistenceError,
    },

    #[error("no document for {identity} and creating one failed: {source}")]
    NotFound {
        identity: OwnerIdentity,
        #[source]
        source: PersistenceError,
    },

    #[error("no document loaded for this session")]
    NoSession,

    #[error("session ended before the operation completed")]
    SessionEnded,

    #[error("{0} is not a record section")]
    NotARecord(String),

    #[error("{0} is not a sequence section")]
    NotASequence(String),

    #[error("{0} is a section and cannot be set as a single value")]
    NotAValue(String),

    #[error("sequence element ids cannot be edited")]
    ImmutableId,

    /// Slug change whose uniqueness check has not come back available
    #[error("slug {0:?} has not been confirmed available")]
    SlugNotConfirmed(String),

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl SyncError {
    /// Whether re-invoking the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Persistence { .. } | SyncError::NotFound { .. })
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
