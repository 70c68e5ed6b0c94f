//! Owns the editor session of the signed-in owner.
//!
//! Only one owner is signed in at a time. Signing in as someone else ends
//! the previous session first, so its realtime subscription is gone before
//! the new one is made.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::info;
use vows_common::OwnerIdentity;
use vows_editor::{EditorSession, EngineConfig, Services, SurfaceMessage, SyncError};

/// Buffered surface messages per preview subscriber
const SURFACE_BUFFER: usize = 64;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("{0} is not signed in")]
    NotSignedIn(OwnerIdentity),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

pub type HostResult<T> = Result<T, HostError>;

pub struct SessionHost {
    services: Services,
    config: EngineConfig,
    surface: broadcast::Sender<SurfaceMessage>,
    current: Mutex<Option<Arc<EditorSession>>>,
}

impl SessionHost {
    pub fn new(services: Services, config: EngineConfig) -> Self {
        let (surface, _) = broadcast::channel(SURFACE_BUFFER);
        Self {
            services,
            config,
            surface,
            current: Mutex::new(None),
        }
    }

    /// Start (or reuse) the session for `identity`
    pub async fn sign_in(&self, identity: OwnerIdentity) -> HostResult<Arc<EditorSession>> {
        let mut current = self.current.lock().await;

        if let Some(session) = current.as_ref() {
            if session.identity() == &identity && !session.is_ended() {
                return Ok(session.clone());
            }
        }
        if let Some(previous) = current.take() {
            info!(from = %previous.identity(), to = %identity, "owner changed, ending session");
            previous.end();
        }

        let session = EditorSession::start(
            identity,
            self.services.clone(),
            Arc::new(self.surface.clone()),
            self.config.clone(),
        )
        .await?;
        let session = Arc::new(session);
        *current = Some(session.clone());
        Ok(session)
    }

    /// End the session for `identity`. Returns whether one was running.
    pub async fn sign_out(&self, identity: &OwnerIdentity) -> bool {
        let mut current = self.current.lock().await;
        match current.as_ref() {
            Some(session) if session.identity() == identity => {
                if let Some(session) = current.take() {
                    session.end();
                }
                true
            }
            _ => false,
        }
    }

    /// Session of `identity`, which must be the signed-in owner
    pub async fn session(&self, identity: &OwnerIdentity) -> HostResult<Arc<EditorSession>> {
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(session) if session.identity() == identity && !session.is_ended() => {
                Ok(session.clone())
            }
            _ => Err(HostError::NotSignedIn(identity.clone())),
        }
    }

    pub async fn current(&self) -> Option<Arc<EditorSession>> {
        self.current.lock().await.clone()
    }

    /// Receiver for everything posted to the rendering surface
    pub fn subscribe_surface(&self) -> broadcast::Receiver<SurfaceMessage> {
        self.surface.subscribe()
    }

    pub async fn shutdown(&self) {
        if let Some(session) = self.current.lock().await.take() {
            session.end();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;

    fn owner(token: &str) -> OwnerIdentity {
        OwnerIdentity::new(token).unwrap()
    }

    fn host() -> (Arc<LocalBackend>, SessionHost) {
        let backend = Arc::new(LocalBackend::in_memory());
        let host = SessionHost::new(Services::from_backend(backend.clone()), EngineConfig::default());
        (backend, host)
    }

    #[tokio::test]
    async fn test_sign_in_reuses_session_for_same_owner() {
        let (_backend, host) = host();

        let first = host.sign_in(owner("alice")).await.unwrap();
        let second = host.sign_in(owner("alice")).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_owner_change_ends_previous_session() {
        let (backend, host) = host();
        let alice = host.sign_in(owner("alice")).await.unwrap();
        assert_eq!(backend.subscriber_count(), 1);

        let bob = host.sign_in(owner("bob")).await.unwrap();

        assert!(alice.is_ended());
        assert!(!bob.is_ended());
        assert_eq!(backend.subscriber_count(), 1);
        assert!(matches!(
            host.session(&owner("alice")).await,
            Err(HostError::NotSignedIn(_))
        ));
    }

    #[tokio::test]
    async fn test_sign_out() {
        let (backend, host) = host();
        host.sign_in(owner("alice")).await.unwrap();

        assert!(!host.sign_out(&owner("bob")).await);
        assert!(host.sign_out(&owner("alice")).await);

        assert!(host.current().await.is_none());
        assert_eq!(backend.subscriber_count(), 0);
    }
}
