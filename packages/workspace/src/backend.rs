//! # Local Backend
//!
//! Single-process implementation of the persistence, realtime and
//! uniqueness services. Documents live in memory and, when a data directory
//! is configured, are mirrored as `<data_dir>/<identity>.json`.
//!
//! Every successful write is published to the owner's realtime
//! subscribers, the same way a hosted backend echoes writes back to every
//! connected client. Files edited by hand are picked up by the
//! [`DataDirWatcher`](crate::DataDirWatcher) and published too.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vows_common::{Document, OwnerIdentity, SLUG_FIELD, SLUG_SECTION};
use vows_editor::{
    LookupError, PersistenceError, PersistenceService, RealtimeError, RealtimeService,
    RemoteChange, Subscription, SubscriptionHandle, UniquenessCheck,
};

const DOCUMENT_EXTENSION: &str = "json";

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid document in {path}: {source}")]
    InvalidFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type BackendResult<T> = Result<T, BackendError>;

struct Subscriber {
    identity: OwnerIdentity,
    changes: mpsc::UnboundedSender<RemoteChange>,
}

#[derive(Default)]
pub struct LocalBackend {
    documents: Mutex<HashMap<OwnerIdentity, Value>>,
    data_dir: Option<PathBuf>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_handle: AtomicU64,
    fail_writes: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LocalBackend {
    /// Backend that forgets everything on exit
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Backend mirrored to `data_dir`; existing documents are loaded eagerly
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> BackendResult<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;

        let mut documents = HashMap::new();
        for entry in std::fs::read_dir(&data_dir)? {
            let path = entry?.path();
            let Some(identity) = identity_for_path(&path) else {
                continue;
            };
            match read_document(&path) {
                Ok(document) => {
                    documents.insert(identity, document);
                }
                Err(err) => warn!(path = %path.display(), error = %err, "skipping document"),
            }
        }
        info!(
            data_dir = %data_dir.display(),
            documents = documents.len(),
            "loaded local documents"
        );

        Ok(Self {
            documents: Mutex::new(documents),
            data_dir: Some(data_dir),
            ..Self::default()
        })
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    /// Make every following write fail until switched back
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn document(&self, identity: &OwnerIdentity) -> Option<Value> {
        lock(&self.documents).get(identity).cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Push `document` to every subscriber of `identity`
    pub fn publish(&self, identity: &OwnerIdentity, document: &Value) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|handle, subscriber| {
            if &subscriber.identity != identity {
                return true;
            }
            let delivered = subscriber
                .changes
                .send(RemoteChange {
                    identity: identity.clone(),
                    document: document.clone(),
                })
                .is_ok();
            if !delivered {
                debug!(handle, "dropping closed subscription");
            }
            delivered
        });
    }

    /// Store a document as if an external writer had saved it, then publish
    pub fn write_external(&self, identity: &OwnerIdentity, document: Value) {
        lock(&self.documents).insert(identity.clone(), document.clone());
        self.publish(identity, &document);
    }

    /// Pick up a document file changed outside this process.
    ///
    /// Returns the owner when the file held a new version that was published.
    pub fn ingest_file(&self, path: &Path) -> BackendResult<Option<OwnerIdentity>> {
        let Some(identity) = identity_for_path(path) else {
            return Ok(None);
        };
        let document = read_document(path)?;

        {
            let mut documents = lock(&self.documents);
            if documents.get(&identity) == Some(&document) {
                return Ok(None);
            }
            documents.insert(identity.clone(), document.clone());
        }

        info!(%identity, path = %path.display(), "document changed on disk");
        self.publish(&identity, &document);
        Ok(Some(identity))
    }

    fn path_for(&self, identity: &OwnerIdentity) -> Result<Option<PathBuf>, PersistenceError> {
        let Some(dir) = &self.data_dir else {
            return Ok(None);
        };
        if !identity.is_path_safe() {
            return Err(PersistenceError::Rejected(format!(
                "identity {identity} cannot be stored on disk"
            )));
        }
        Ok(Some(
            dir.join(format!("{}.{}", identity.as_str(), DOCUMENT_EXTENSION)),
        ))
    }
}

fn identity_for_path(path: &Path) -> Option<OwnerIdentity> {
    if path.extension().and_then(|ext| ext.to_str()) != Some(DOCUMENT_EXTENSION) {
        return None;
    }
    let identity = OwnerIdentity::new(path.file_stem()?.to_str()?).ok()?;
    identity.is_path_safe().then_some(identity)
}

fn read_document(path: &Path) -> BackendResult<Value> {
    let source = std::fs::read_to_string(path)?;
    serde_json::from_str(&source).map_err(|source| BackendError::InvalidFile {
        path: path.to_path_buf(),
        source,
    })
}

#[async_trait]
impl PersistenceService for LocalBackend {
    async fn load(&self, identity: &OwnerIdentity) -> Result<Option<Value>, PersistenceError> {
        Ok(self.document(identity))
    }

    async fn persist(
        &self,
        identity: &OwnerIdentity,
        document: &Document,
    ) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("writes are disabled".into()));
        }
        let path = self.path_for(identity)?;
        let value = document.to_value();

        let previous = lock(&self.documents).insert(identity.clone(), value.clone());

        if let Some(path) = path {
            let written = match serde_json::to_vec_pretty(&value) {
                Ok(bytes) => tokio::fs::write(&path, bytes)
                    .await
                    .map_err(PersistenceError::from),
                Err(err) => Err(PersistenceError::from(err)),
            };
            if let Err(err) = written {
                let mut documents = lock(&self.documents);
                match previous {
                    Some(previous) => documents.insert(identity.clone(), previous),
                    None => documents.remove(identity),
                };
                return Err(err);
            }
        }

        debug!(%identity, "document persisted");
        self.publish(identity, &value);
        Ok(())
    }
}

#[async_trait]
impl RealtimeService for LocalBackend {
    async fn subscribe(&self, identity: &OwnerIdentity) -> Result<Subscription, RealtimeError> {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let (changes, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).insert(
            handle.0,
            Subscriber {
                identity: identity.clone(),
                changes,
            },
        );
        debug!(%identity, handle = handle.0, "realtime subscriber added");
        Ok(Subscription {
            handle,
            changes: rx,
        })
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        if lock(&self.subscribers).remove(&handle.0).is_some() {
            debug!(handle = handle.0, "realtime subscriber removed");
        }
    }
}

#[async_trait]
impl UniquenessCheck for LocalBackend {
    async fn is_unique(
        &self,
        value: &str,
        exclude: Option<&OwnerIdentity>,
    ) -> Result<bool, LookupError> {
        let documents = lock(&self.documents);
        let taken = documents.iter().any(|(identity, document)| {
            Some(identity) != exclude
                && document
                    .get(SLUG_SECTION)
                    .and_then(|section| section.get(SLUG_FIELD))
                    .and_then(Value::as_str)
                    == Some(value)
        });
        Ok(!taken)
    }
}
