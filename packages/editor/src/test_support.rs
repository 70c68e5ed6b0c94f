//! In-memory fakes for the service boundaries, used by unit tests.

use crate::errors::{LookupError, PersistenceError, RealtimeError, SurfaceError};
use crate::preview::{SurfaceEndpoint, SurfaceMessage};
use crate::services::{
    PersistenceService, RealtimeService, RemoteChange, Services, Subscription,
    SubscriptionHandle, UniquenessCheck,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use vows_common::{Document, OwnerIdentity};

pub fn owner(token: &str) -> OwnerIdentity {
    OwnerIdentity::new(token).unwrap()
}

/// Persistence fake with failure injection and scripted, gated writes
#[derive(Default)]
pub struct FakeBackend {
    pub docs: Mutex<HashMap<OwnerIdentity, Value>>,
    pub fail_persist: AtomicBool,
    pub persist_calls: AtomicUsize,
    gates: Mutex<VecDeque<oneshot::Receiver<Result<(), PersistenceError>>>>,
    subscribers: Mutex<HashMap<u64, (OwnerIdentity, mpsc::UnboundedSender<RemoteChange>)>>,
    next_handle: AtomicU64,
    pub unsubscribed: Mutex<Vec<SubscriptionHandle>>,
    pub taken_slugs: Mutex<HashSet<String>>,
    pub lookups: Mutex<Vec<String>>,
    pub lookup_delay: Mutex<Option<Duration>>,
    /// Pushed to subscribers when the next load runs, as a concurrent writer would
    pub remote_during_load: Mutex<Option<Value>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn services(self: &Arc<Self>) -> Services {
        Services::from_backend(self.clone())
    }

    pub fn seed(&self, identity: &OwnerIdentity, document: Value) {
        self.docs.lock().unwrap().insert(identity.clone(), document);
    }

    pub fn stored(&self, identity: &OwnerIdentity) -> Option<Value> {
        self.docs.lock().unwrap().get(identity).cloned()
    }

    /// Next persist call waits for the returned sender and uses its result
    pub fn gate_next_persist(&self) -> oneshot::Sender<Result<(), PersistenceError>> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().unwrap().push_back(rx);
        tx
    }

    pub fn push_remote(&self, identity: &OwnerIdentity, document: Value) {
        for (owner, tx) in self.subscribers.lock().unwrap().values() {
            if owner == identity {
                let _ = tx.send(RemoteChange {
                    identity: identity.clone(),
                    document: document.clone(),
                });
            }
        }
    }

    /// Drop every live subscription channel, as if the socket went away
    pub fn drop_subscriptions(&self) {
        self.subscribers.lock().unwrap().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

#[async_trait]
impl PersistenceService for FakeBackend {
    async fn load(&self, identity: &OwnerIdentity) -> Result<Option<Value>, PersistenceError> {
        let stored = self.stored(identity);
        let concurrent = self.remote_during_load.lock().unwrap().take();
        if let Some(document) = concurrent {
            self.push_remote(identity, document);
        }
        Ok(stored)
    }

    async fn persist(
        &self,
        identity: &OwnerIdentity,
        document: &Document,
    ) -> Result<(), PersistenceError> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gates.lock().unwrap().pop_front();
        if let Some(gate) = gate {
            gate.await
                .map_err(|_| PersistenceError::Unavailable("gate dropped".into()))??;
        }
        if self.fail_persist.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("offline".into()));
        }
        self.seed(identity, document.to_value());
        Ok(())
    }
}

#[async_trait]
impl RealtimeService for FakeBackend {
    async fn subscribe(&self, identity: &OwnerIdentity) -> Result<Subscription, RealtimeError> {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap()
            .insert(handle.0, (identity.clone(), tx));
        Ok(Subscription {
            handle,
            changes: rx,
        })
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.subscribers.lock().unwrap().remove(&handle.0);
        self.unsubscribed.lock().unwrap().push(handle);
    }
}

#[async_trait]
impl UniquenessCheck for FakeBackend {
    async fn is_unique(
        &self,
        value: &str,
        _exclude: Option<&OwnerIdentity>,
    ) -> Result<bool, LookupError> {
        self.lookups.lock().unwrap().push(value.to_string());
        let delay = *self.lookup_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(!self.taken_slugs.lock().unwrap().contains(value))
    }
}

/// Surface that records every posted message
pub fn recording_surface() -> (Arc<dyn SurfaceEndpoint>, mpsc::UnboundedReceiver<SurfaceMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(tx), rx)
}

/// Receive surface messages until one matches, failing after a timeout
pub async fn recv_until<F>(
    rx: &mut mpsc::UnboundedReceiver<SurfaceMessage>,
    mut predicate: F,
) -> SurfaceMessage
where
    F: FnMut(&SurfaceMessage) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Some(message) if predicate(&message) => return message,
                Some(_) => continue,
                None => panic!("surface channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("no matching surface message")
}

/// Surface that always reports itself detached
pub struct DetachedSurface;

impl SurfaceEndpoint for DetachedSurface {
    fn post(&self, _message: SurfaceMessage) -> Result<(), SurfaceError> {
        Err(SurfaceError::Detached)
    }
}
