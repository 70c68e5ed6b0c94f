//! # Document Store
//!
//! Owns the committed document for one owner and mediates every write to
//! the persistence service.
//!
//! ## Lifecycle
//!
//! ```text
//! load ──▶ confirmed ──commit──▶ committed = confirmed ⊕ in-flight patches
//!              ▲                        │
//!              │                 persist (one at a time, in commit order)
//!              │                        ├─▶ ok:   confirmed = written document
//!              │                        └─▶ fail: patch dropped, committed rebuilt
//!              └────────────── replace_committed (realtime), in-flight replayed
//! ```
//!
//! The optimistic merge is visible to readers before the persistence call
//! starts. Writes are serialized, so once nothing is in flight the stored
//! document and `committed()` are the same.

use crate::errors::{SyncError, SyncResult};
use crate::services::PersistenceService;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Mutex as WriteLock};
use tracing::{debug, info, warn};
use vows_common::{normalize, Document, DocumentPatch, IdGenerator, OwnerIdentity};

#[derive(Debug)]
struct InFlight {
    ticket: u64,
    patch: DocumentPatch,
}

#[derive(Debug, Default)]
struct StoreState {
    identity: Option<OwnerIdentity>,
    /// Last document known to be in storage
    confirmed: Document,
    /// `confirmed` with every in-flight patch applied, in commit order
    committed: Document,
    in_flight: Vec<InFlight>,
    next_ticket: u64,
    /// Bumped on load and reset; stale completions compare against it
    epoch: u64,
}

impl StoreState {
    fn rebuild(&mut self) {
        let mut committed = self.confirmed.clone();
        for entry in &self.in_flight {
            committed.apply_patch(&entry.patch);
        }
        self.committed = committed;
    }

    /// Document to write for `ticket`: confirmed plus every patch up to it
    fn write_for(&self, ticket: u64) -> Document {
        let mut document = self.confirmed.clone();
        for entry in self.in_flight.iter().take_while(|e| e.ticket <= ticket) {
            document.apply_patch(&entry.patch);
        }
        document
    }

    fn settle(&mut self, ticket: u64) {
        self.in_flight.retain(|entry| entry.ticket != ticket);
    }
}

/// Takes an in-flight patch back out if its commit is dropped before it settles
struct InFlightGuard<'a> {
    store: &'a DocumentStore,
    ticket: u64,
    epoch: u64,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = self.store.state();
            if state.epoch != self.epoch {
                return;
            }
            state.settle(self.ticket);
            state.rebuild();
        }
        self.store.bump();
    }
}

/// Canonical committed document with optimistic commit and rollback
#[derive(Clone)]
pub struct DocumentStore {
    state: Arc<Mutex<StoreState>>,
    /// Held across each persist call so writes land in commit order
    writes: Arc<WriteLock<()>>,
    persistence: Arc<dyn PersistenceService>,
    ids: Arc<IdGenerator>,
    default_template_id: String,
    revision: Arc<watch::Sender<u64>>,
}

impl DocumentStore {
    pub fn new(
        persistence: Arc<dyn PersistenceService>,
        ids: Arc<IdGenerator>,
        default_template_id: impl Into<String>,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            writes: Arc::new(WriteLock::new(())),
            persistence,
            ids,
            default_template_id: default_template_id.into(),
            revision: Arc::new(revision),
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    /// Fetch the committed document, creating the default one if missing
    pub async fn load(&self, identity: &OwnerIdentity) -> SyncResult<Document> {
        let stored = self
            .persistence
            .load(identity)
            .await
            .map_err(|source| SyncError::Persistence { source })?;

        let document = match stored {
            Some(raw) => normalize(raw, &self.ids)?,
            None => {
                info!(%identity, "no document found, creating default");
                let document = Document::default_for(&self.default_template_id, &self.ids);
                self.persistence
                    .persist(identity, &document)
                    .await
                    .map_err(|source| SyncError::NotFound {
                        identity: identity.clone(),
                        source,
                    })?;
                document
            }
        };

        {
            let mut state = self.state();
            state.identity = Some(identity.clone());
            state.confirmed = document.clone();
            state.committed = document.clone();
            state.in_flight.clear();
            state.epoch += 1;
        }
        self.bump();

        debug!(%identity, "document loaded");
        Ok(document)
    }

    /// Shallow-merge `patch` into the committed document and persist it.
    ///
    /// On failure the patch is taken back out before this returns; commits
    /// still in flight stay applied.
    pub async fn commit(&self, patch: DocumentPatch) -> SyncResult<()> {
        let (identity, ticket, epoch) = {
            let mut state = self.state();
            let identity = state.identity.clone().ok_or(SyncError::NoSession)?;
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.committed.apply_patch(&patch);
            state.in_flight.push(InFlight {
                ticket,
                patch: patch.clone(),
            });
            (identity, ticket, state.epoch)
        };
        self.bump();
        let mut guard = InFlightGuard {
            store: self,
            ticket,
            epoch,
            armed: true,
        };

        let keys: Vec<&String> = patch.keys().collect();
        debug!(%identity, ?keys, ticket, "optimistic merge applied, persisting");

        let _write = self.writes.lock().await;

        let document = {
            let state = self.state();
            if state.epoch != epoch {
                debug!(%identity, "commit dropped, session was torn down");
                return Err(SyncError::SessionEnded);
            }
            state.write_for(ticket)
        };

        let result = self.persistence.persist(&identity, &document).await;
        guard.armed = false;

        let mut state = self.state();
        if state.epoch != epoch {
            debug!(%identity, "commit finished after the session was torn down");
            return Err(SyncError::SessionEnded);
        }
        state.settle(ticket);
        if result.is_ok() {
            state.confirmed = document;
        }
        let before = state.committed.clone();
        state.rebuild();
        let changed = state.committed != before;
        drop(state);
        if changed {
            self.bump();
        }

        result.map_err(|source| {
            warn!(%identity, error = %source, "persist failed, rolled back");
            SyncError::Persistence { source }
        })
    }

    /// Replace the committed document wholesale (remote notification).
    ///
    /// Commits still in flight are replayed on top of the new document.
    ///
    /// Returns `false` without touching anything when `identity` is not the
    /// owner this store is currently loaded for.
    pub fn replace_committed(&self, identity: &OwnerIdentity, document: Document) -> bool {
        {
            let mut state = self.state();
            if state.identity.as_ref() != Some(identity) {
                return false;
            }
            state.confirmed = document;
            state.rebuild();
        }
        self.bump();
        true
    }

    /// Discard everything tied to the current identity
    pub fn reset(&self) {
        {
            let mut state = self.state();
            let epoch = state.epoch + 1;
            *state = StoreState {
                epoch,
                ..StoreState::default()
            };
        }
        self.bump();
    }

    pub fn committed(&self) -> Document {
        self.state().committed.clone()
    }

    pub fn identity(&self) -> Option<OwnerIdentity> {
        self.state().identity.clone()
    }

    /// Number of commits awaiting their persistence result
    pub fn in_flight(&self) -> usize {
        self.state().in_flight.len()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Receiver that changes whenever the committed document does
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn ids(&self) -> &Arc<IdGenerator> {
        &self.ids
    }
}
