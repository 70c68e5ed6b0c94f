//! # Realtime Reconciler
//!
//! Applies remote change notifications for the current owner to the
//! [`DocumentStore`]. Every notification is normalized and then replaces the
//! committed document wholesale. The pending overlay is never touched, so
//! edits the owner has not saved keep rendering on top of the new base.
//!
//! [`RealtimeReconciler::connect`] subscribes without delivering, so a
//! caller can load the store afterwards and then [`listen`] without losing
//! a change that landed in between.
//!
//! When the subscription channel closes the reconciler resubscribes in the
//! background with exponential backoff. [`RealtimeReconciler::stop`] (also
//! run on drop) unsubscribes and guarantees nothing is delivered into the
//! store afterwards.
//!
//! [`listen`]: RealtimeReconciler::listen

use crate::errors::RealtimeError;
use crate::services::{RealtimeService, Subscription, SubscriptionHandle};
use crate::store::DocumentStore;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vows_common::{normalize, OwnerIdentity};

#[derive(Debug, Default)]
struct Active {
    handle: Option<SubscriptionHandle>,
    stopped: bool,
}

struct Shared {
    identity: OwnerIdentity,
    realtime: Arc<dyn RealtimeService>,
    store: DocumentStore,
    active: Mutex<Active>,
    retry: Duration,
    retry_max: Duration,
}

impl Shared {
    fn active(&self) -> MutexGuard<'_, Active> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a fresh subscription; refuses (and unsubscribes) once stopped
    fn register(&self, handle: SubscriptionHandle) -> bool {
        let mut active = self.active();
        if active.stopped {
            drop(active);
            self.realtime.unsubscribe(handle);
            return false;
        }
        active.handle = Some(handle);
        true
    }

    fn release(&self, handle: SubscriptionHandle) {
        let mut active = self.active();
        if active.handle == Some(handle) {
            active.handle = None;
        }
        drop(active);
        self.realtime.unsubscribe(handle);
    }

    fn is_stopped(&self) -> bool {
        self.active().stopped
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        (delay * 2).min(self.retry_max)
    }
}

pub struct RealtimeReconciler {
    shared: Arc<Shared>,
    /// First subscription, buffered until [`RealtimeReconciler::listen`]
    parked: Option<Subscription>,
    task: Option<JoinHandle<()>>,
}

impl RealtimeReconciler {
    /// Subscribe for `identity` and start applying notifications to `store`.
    ///
    /// The first subscription attempt happens before this returns. If it
    /// fails the reconciler keeps retrying in the background.
    pub async fn start(
        identity: OwnerIdentity,
        realtime: Arc<dyn RealtimeService>,
        store: DocumentStore,
        retry: Duration,
        retry_max: Duration,
    ) -> Self {
        let mut reconciler = Self::connect(identity, realtime, store, retry, retry_max).await;
        reconciler.listen();
        reconciler
    }

    /// Subscribe without delivering anything yet.
    ///
    /// Notifications queue up on the subscription until [`listen`] is
    /// called, so the store can be loaded in between without missing a
    /// change made while the load was running.
    ///
    /// [`listen`]: RealtimeReconciler::listen
    pub async fn connect(
        identity: OwnerIdentity,
        realtime: Arc<dyn RealtimeService>,
        store: DocumentStore,
        retry: Duration,
        retry_max: Duration,
    ) -> Self {
        let shared = Arc::new(Shared {
            identity,
            realtime,
            store,
            active: Mutex::new(Active::default()),
            retry,
            retry_max,
        });

        let parked = match shared.realtime.subscribe(&shared.identity).await {
            Ok(subscription) => {
                shared.register(subscription.handle);
                debug!(identity = %shared.identity, handle = subscription.handle.0, "subscribed");
                Some(subscription)
            }
            Err(err) => {
                warn!(identity = %shared.identity, error = %err, "realtime subscription failed");
                None
            }
        };

        Self {
            shared,
            parked,
            task: None,
        }
    }

    /// Start applying queued and future notifications. No-op once running or stopped.
    pub fn listen(&mut self) {
        if self.task.is_some() || self.shared.is_stopped() {
            return;
        }
        let first = self.parked.take();
        self.task = Some(tokio::spawn(run(self.shared.clone(), first)));
    }

    pub fn identity(&self) -> &OwnerIdentity {
        &self.shared.identity
    }

    /// Handle of the live subscription, if any
    pub fn handle(&self) -> Option<SubscriptionHandle> {
        self.shared.active().handle
    }

    /// Unsubscribe and stop the delivery task. Idempotent.
    pub fn stop(&mut self) {
        let handle = {
            let mut active = self.shared.active();
            active.stopped = true;
            active.handle.take()
        };
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.parked = None;
        if let Some(handle) = handle {
            self.shared.realtime.unsubscribe(handle);
            debug!(identity = %self.shared.identity, handle = handle.0, "unsubscribed");
        }
    }
}

impl Drop for RealtimeReconciler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(shared: Arc<Shared>, mut pending: Option<Subscription>) {
    let mut delay = shared.retry;

    loop {
        let subscription = match pending.take() {
            Some(subscription) => subscription,
            None => match shared.realtime.subscribe(&shared.identity).await {
                Ok(subscription) => {
                    if !shared.register(subscription.handle) {
                        return;
                    }
                    info!(identity = %shared.identity, "realtime subscription restored");
                    delay = shared.retry;
                    subscription
                }
                Err(err) => {
                    warn!(
                        identity = %shared.identity,
                        error = %err,
                        retry_in = ?delay,
                        "realtime subscription failed"
                    );
                    tokio::time::sleep(delay).await;
                    delay = shared.next_delay(delay);
                    continue;
                }
            },
        };

        let handle = subscription.handle;
        if deliver(&shared, subscription).await.is_break() {
            shared.release(handle);
            return;
        }

        shared.release(handle);
        if shared.is_stopped() {
            return;
        }
        let err = RealtimeError::Closed;
        warn!(identity = %shared.identity, error = %err, retry_in = ?delay, "resubscribing");
        tokio::time::sleep(delay).await;
        delay = shared.next_delay(delay);
    }
}

/// Apply notifications until the channel closes. Breaks when the store no
/// longer belongs to this identity.
async fn deliver(shared: &Shared, subscription: Subscription) -> std::ops::ControlFlow<()> {
    let mut changes = subscription.changes;

    while let Some(change) = changes.recv().await {
        if change.identity != shared.identity {
            debug!(
                expected = %shared.identity,
                got = %change.identity,
                "ignoring notification for another owner"
            );
            continue;
        }

        let document = match normalize(change.document, shared.store.ids()) {
            Ok(document) => document,
            Err(err) => {
                warn!(
                    identity = %shared.identity,
                    error = %err,
                    "ignoring malformed remote document"
                );
                continue;
            }
        };

        if !shared.store.replace_committed(&shared.identity, document) {
            debug!(identity = %shared.identity, "store moved to another owner, stopping");
            return std::ops::ControlFlow::Break(());
        }
        info!(identity = %shared.identity, "applied remote document");
    }

    std::ops::ControlFlow::Continue(())
}
