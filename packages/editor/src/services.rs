//! # Service Boundaries
//!
//! The engine talks to the outside world through three object-safe traits:
//!
//! - [`PersistenceService`]: key-value-by-identity document storage
//! - [`RealtimeService`]: change notifications scoped to one owner
//! - [`UniquenessCheck`]: remote lookup used by the slug validator
//!
//! Implementations live outside this crate (see `vows-workspace`).

use crate::errors::{LookupError, PersistenceError, RealtimeError};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use vows_common::{Document, OwnerIdentity};

#[async_trait]
pub trait PersistenceService: Send + Sync {
    /// Raw stored document for the identity, `None` if it has none yet
    async fn load(&self, identity: &OwnerIdentity) -> Result<Option<Value>, PersistenceError>;

    /// Replace the stored document for the identity
    async fn persist(
        &self,
        identity: &OwnerIdentity,
        document: &Document,
    ) -> Result<(), PersistenceError>;
}

/// Full replacement document pushed by the realtime service
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub identity: OwnerIdentity,
    pub document: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// Live subscription; the receiver closes when the channel drops
#[derive(Debug)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub changes: mpsc::UnboundedReceiver<RemoteChange>,
}

#[async_trait]
pub trait RealtimeService: Send + Sync {
    async fn subscribe(&self, identity: &OwnerIdentity) -> Result<Subscription, RealtimeError>;

    /// Tear down a subscription. Unknown handles are ignored.
    fn unsubscribe(&self, handle: SubscriptionHandle);
}

#[async_trait]
pub trait UniquenessCheck: Send + Sync {
    /// Whether `value` is free, ignoring whatever `exclude` already owns
    async fn is_unique(
        &self,
        value: &str,
        exclude: Option<&OwnerIdentity>,
    ) -> Result<bool, LookupError>;
}

/// Bundle of service implementations handed to a session
#[derive(Clone)]
pub struct Services {
    pub persistence: Arc<dyn PersistenceService>,
    pub realtime: Arc<dyn RealtimeService>,
    pub uniqueness: Arc<dyn UniquenessCheck>,
}

impl Services {
    /// All three boundaries served by one backend
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: PersistenceService + RealtimeService + UniquenessCheck + 'static,
    {
        Self {
            persistence: backend.clone(),
            realtime: backend.clone(),
            uniqueness: backend,
        }
    }
}
