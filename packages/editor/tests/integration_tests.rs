//! Integration tests for the editor crate's public API

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use vows_common::{normalize, Document, IdGenerator, OwnerIdentity};
use vows_editor::{
    EditorSession, EngineConfig, LookupError, PendingChanges, PersistenceError,
    PersistenceService, RealtimeError, RealtimeService, RemoteChange, Services, SurfaceEndpoint,
    Subscription, SubscriptionHandle, SurfaceMessage, SyncError, UniquenessCheck,
    ValidationState,
};

#[derive(Default)]
struct MemoryBackend {
    docs: Mutex<HashMap<OwnerIdentity, Value>>,
    offline: AtomicBool,
    subscribers: Mutex<HashMap<u64, (OwnerIdentity, mpsc::UnboundedSender<RemoteChange>)>>,
    next_handle: AtomicU64,
    lookups: Mutex<Vec<String>>,
}

impl MemoryBackend {
    fn push_remote(&self, identity: &OwnerIdentity, document: Value) {
        for (owner, tx) in self.subscribers.lock().unwrap().values() {
            if owner == identity {
                let _ = tx.send(RemoteChange {
                    identity: identity.clone(),
                    document: document.clone(),
                });
            }
        }
    }
}

#[async_trait]
impl PersistenceService for MemoryBackend {
    async fn load(&self, identity: &OwnerIdentity) -> Result<Option<Value>, PersistenceError> {
        Ok(self.docs.lock().unwrap().get(identity).cloned())
    }

    async fn persist(
        &self,
        identity: &OwnerIdentity,
        document: &Document,
    ) -> Result<(), PersistenceError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("offline".into()));
        }
        self.docs
            .lock()
            .unwrap()
            .insert(identity.clone(), document.to_value());
        Ok(())
    }
}

#[async_trait]
impl RealtimeService for MemoryBackend {
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
    }
}

#[async_trait]
impl UniquenessCheck for MemoryBackend {
    async fn is_unique(
        &self,
        value: &str,
        _exclude: Option<&OwnerIdentity>,
    ) -> Result<bool, LookupError> {
        self.lookups.lock().unwrap().push(value.to_string());
        Ok(true)
    }
}

fn alice() -> OwnerIdentity {
    OwnerIdentity::new("alice").unwrap()
}

async fn start(
    backend: &Arc<MemoryBackend>,
) -> (EditorSession, mpsc::UnboundedReceiver<SurfaceMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let surface: Arc<dyn SurfaceEndpoint> = Arc::new(tx);
    let session = EditorSession::start(
        alice(),
        Services::from_backend(backend.clone()),
        surface,
        EngineConfig::default(),
    )
    .await
    .unwrap();
    (session, rx)
}

#[test]
fn test_merge_is_idempotent() {
    let ids = IdGenerator::from_seed("i");
    let committed = Document::default_for("model_1", &ids);
    let mut pending = PendingChanges::new();
    pending
        .set_pending(&committed, "couple", "partnerOne", json!("Alex"))
        .unwrap();
    pending
        .set_pending_item(&committed, &ids, "schedule", 2, "time", json!("6:00 PM"))
        .unwrap();

    let once = pending.merge(&committed);
    let twice = pending.merge(&once);

    assert_eq!(once, twice);
}

#[tokio::test]
async fn test_commit_is_persisted_and_leaves_pending() {
    let backend = Arc::new(MemoryBackend::default());
    let (session, _surface) = start(&backend).await;

    session
        .set_pending("story", "title", json!("How we met"))
        .unwrap();
    session
        .set_pending("contact", "email", json!("us@example.com"))
        .unwrap();
    assert!(session.commit_section("story").await.unwrap());

    let stored = backend.docs.lock().unwrap().get(&alice()).cloned().unwrap();
    assert_eq!(stored["story"]["title"], json!("How we met"));
    assert!(session.pending().section("story").is_none());
    assert!(session.pending().section("contact").is_some());
}

#[tokio::test]
async fn test_failed_commit_rolls_back_completely() {
    let backend = Arc::new(MemoryBackend::default());
    let (session, _surface) = start(&backend).await;
    let before = session.committed();

    session.set_pending("couple", "tagline", json!("Forever")).unwrap();
    backend.offline.store(true, Ordering::SeqCst);
    let result = session.save_all().await;

    assert!(matches!(result, Err(SyncError::Persistence { .. })));
    assert!(result.unwrap_err().is_retryable());
    assert_eq!(session.committed(), before);
    assert_eq!(session.pending().field("couple", "tagline"), Some(&json!("Forever")));
}

#[tokio::test]
async fn test_schedule_edit_past_end_pads_sequence() {
    let backend = Arc::new(MemoryBackend::default());
    let (session, _surface) = start(&backend).await;

    session
        .set_pending_item("schedule", 3, "event", json!("First dance"))
        .unwrap();

    let snapshot = session.snapshot();
    let schedule = snapshot.sequence("schedule");
    assert_eq!(schedule.len(), 4);
    assert_eq!(schedule[3]["event"], json!("First dance"));
    for item in schedule {
        assert!(item["id"].as_str().is_some_and(|id| !id.is_empty()));
    }
}

#[tokio::test]
async fn test_remote_change_leaves_pending_untouched() {
    let backend = Arc::new(MemoryBackend::default());
    let (session, _surface) = start(&backend).await;
    session.set_pending("couple", "partnerTwo", json!("Sam")).unwrap();

    let mut remote = session.committed().into_value();
    remote["story"]["title"] = json!("Edited elsewhere");
    backend.push_remote(&alice(), remote);

    tokio::time::timeout(Duration::from_secs(5), async {
        while session.committed().field("story", "title") != Some(&json!("Edited elsewhere")) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("remote change not applied");

    assert_eq!(session.pending().field("couple", "partnerTwo"), Some(&json!("Sam")));
    assert_eq!(session.snapshot().field("couple", "partnerTwo"), Some(&json!("Sam")));
}

#[tokio::test]
async fn test_template_preview_overrides_snapshot() {
    let backend = Arc::new(MemoryBackend::default());
    let (session, mut surface) = start(&backend).await;

    session.set_pending_value("activeTemplateId", json!("model_2")).unwrap();
    session.preview_template("model_4").unwrap();

    assert_eq!(session.snapshot().active_template_id(), Some("model_4"));

    session.surface_ready().unwrap();
    let changed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match surface.recv().await {
                Some(SurfaceMessage::SurfaceChanged { template_id, .. }) => return template_id,
                Some(_) => continue,
                None => panic!("surface closed"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(changed.as_deref(), Some("model_4"));
}

#[tokio::test(start_paused = true)]
async fn test_slug_debounce_checks_latest_value_only() {
    let backend = Arc::new(MemoryBackend::default());
    let (session, _surface) = start(&backend).await;

    session.set_pending("moreInfo", "slug", json!("ab")).unwrap();
    assert!(matches!(session.slug_state(), ValidationState::Invalid { .. }));

    for value in ["alex", "alex-and", "alex-and-sam"] {
        session.check_slug(value);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(*backend.lookups.lock().unwrap(), vec!["alex-and-sam".to_string()]);
    assert_eq!(
        session.slug_state(),
        ValidationState::Available {
            value: "alex-and-sam".to_string()
        }
    );
}

#[test]
fn test_normalize_repairs_sequence_ids() {
    let ids = IdGenerator::from_seed("n");
    let document = normalize(
        json!({ "schedule": [{ "id": "a" }, { "id": "a" }, { "time": "noon" }] }),
        &ids,
    )
    .unwrap();

    let schedule = document.sequence("schedule");
    assert_eq!(schedule.len(), 3);
    assert_eq!(schedule[0]["id"], json!("a"));
    assert_ne!(schedule[1]["id"], json!("a"));
    assert!(schedule[2]["id"].as_str().is_some_and(|id| !id.is_empty()));
}
