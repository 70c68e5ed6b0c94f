//! # Editor Session
//!
//! One signed-in owner editing their site.
//!
//! An EditorSession wires the document store, the pending tracker, the
//! template overlay, the slug validator, the realtime reconciler and the
//! preview channel together for a single identity. Widgets only talk to the
//! session: `set_pending*` for edits that wait for an explicit save, and the
//! `commit*` family for edits that save immediately.
//!
//! ```text
//! widget ──set_pending──▶ PendingTracker ─┐
//!        ──commit───────▶ DocumentStore ──┼──▶ PreviewChannel ──▶ surface
//! remote ──────────────▶ RealtimeReconciler┘
//! ```
//!
//! Ending the session (explicitly or by dropping it) unsubscribes from the
//! realtime service, stops the preview task and forgets all local state.

use crate::config::EngineConfig;
use crate::errors::{SurfaceError, SyncError, SyncResult};
use crate::pending::{PendingChanges, PendingTracker};
use crate::preview::{PreviewChannel, SnapshotSource, SurfaceEndpoint};
use crate::realtime::RealtimeReconciler;
use crate::services::Services;
use crate::store::DocumentStore;
use crate::template::TemplatePreview;
use crate::validator::{SlugValidator, ValidationState};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vows_common::{
    item_id, Document, DocumentPatch, IdGenerator, OwnerIdentity, SequenceKind,
    ACTIVE_TEMPLATE_ID, SLUG_FIELD, SLUG_SECTION,
};

pub struct EditorSession {
    /// Unique session identifier (also the id seed for new elements)
    id: String,
    identity: OwnerIdentity,
    store: DocumentStore,
    pending: PendingTracker,
    template: TemplatePreview,
    source: SnapshotSource,
    validator: SlugValidator,
    reconciler: Mutex<Option<RealtimeReconciler>>,
    preview: Mutex<Option<PreviewChannel>>,
    ended: AtomicBool,
}

impl EditorSession {
    /// Load the owner's document and start syncing it.
    ///
    /// Creates the default document when the owner has none yet. The realtime
    /// subscription is opened before the load so nothing written in between
    /// is missed.
    pub async fn start(
        identity: OwnerIdentity,
        services: Services,
        surface: Arc<dyn SurfaceEndpoint>,
        config: EngineConfig,
    ) -> SyncResult<Self> {
        let ids = Arc::new(IdGenerator::for_owner(identity.as_str()));
        let id = ids.seed().to_string();

        let store = DocumentStore::new(
            services.persistence.clone(),
            ids.clone(),
            config.default_template_id.clone(),
        );
        let mut reconciler = RealtimeReconciler::connect(
            identity.clone(),
            services.realtime.clone(),
            store.clone(),
            config.realtime_retry,
            config.realtime_retry_max,
        )
        .await;
        store.load(&identity).await?;
        reconciler.listen();

        let pending = PendingTracker::new(ids);
        let template = TemplatePreview::new();
        let source = SnapshotSource::new(store.clone(), pending.clone(), template.clone());

        let preview = PreviewChannel::spawn(source.clone(), surface);
        if let Err(err) = preview.push_now() {
            debug!(error = %err, "initial snapshot not delivered");
        }

        let validator = SlugValidator::new(
            services.uniqueness.clone(),
            Some(identity.clone()),
            config.slug_debounce,
        );

        info!(%identity, session = %id, "editor session started");

        Ok(Self {
            id,
            identity,
            store,
            pending,
            template,
            source,
            validator,
            reconciler: Mutex::new(Some(reconciler)),
            preview: Mutex::new(Some(preview)),
            ended: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &OwnerIdentity {
        &self.identity
    }

    fn live(&self) -> SyncResult<()> {
        if self.ended.load(Ordering::SeqCst) {
            Err(SyncError::SessionEnded)
        } else {
            Ok(())
        }
    }

    /// Committed document as last persisted or pushed
    pub fn committed(&self) -> Document {
        self.store.committed()
    }

    pub fn pending(&self) -> PendingChanges {
        self.pending.snapshot()
    }

    /// What the rendering surface is showing
    pub fn snapshot(&self) -> Document {
        self.source.compose()
    }

    /// Receiver that changes whenever the snapshot may have changed
    pub fn subscribe(&self) -> [watch::Receiver<u64>; 3] {
        [
            self.store.subscribe(),
            self.pending.subscribe(),
            self.template.subscribe(),
        ]
    }

    // Pending edits

    pub fn set_pending(&self, section: &str, field: &str, value: Value) -> SyncResult<bool> {
        self.live()?;
        if section == SLUG_SECTION && field == SLUG_FIELD {
            self.validator.on_change(value.as_str().unwrap_or_default());
        }
        self.pending
            .set_pending(&self.store.committed(), section, field, value)
    }

    pub fn set_pending_item(
        &self,
        section: &str,
        index: usize,
        field: &str,
        value: Value,
    ) -> SyncResult<bool> {
        self.live()?;
        self.pending
            .set_pending_item(&self.store.committed(), section, index, field, value)
    }

    /// Pending top-level value such as `activeTemplateId`
    pub fn set_pending_value(&self, key: &str, value: Value) -> SyncResult<bool> {
        self.live()?;
        self.pending
            .set_pending_value(&self.store.committed(), key, value)
    }

    pub fn replace_sequence(&self, section: &str, items: Vec<Value>) -> SyncResult<bool> {
        self.live()?;
        self.pending
            .replace_sequence(&self.store.committed(), section, items)
    }

    /// Append an empty element to a sequence. Returns its id.
    pub fn add_item(&self, section: &str) -> SyncResult<String> {
        self.live()?;
        let kind = SequenceKind::from_section(section)
            .ok_or_else(|| SyncError::NotASequence(section.to_string()))?;

        let committed = self.store.committed();
        let mut items = self.pending.merge(&committed).sequence(section).to_vec();
        let taken: Vec<&str> = items
            .iter()
            .chain(committed.sequence(section))
            .filter_map(item_id)
            .collect();
        let id = self.store.ids().new_id_avoiding(taken.iter().copied());
        drop(taken);

        items.push(kind.empty_item(id.clone()));
        self.pending.replace_sequence(&committed, section, items)?;
        debug!(section, item = %id, "item added");
        Ok(id)
    }

    /// Remove the element with `id` from a sequence
    pub fn remove_item(&self, section: &str, id: &str) -> SyncResult<bool> {
        self.live()?;
        SequenceKind::from_section(section)
            .ok_or_else(|| SyncError::NotASequence(section.to_string()))?;

        let committed = self.store.committed();
        let items = self.pending.merge(&committed).sequence(section).to_vec();
        let before = items.len();
        let kept: Vec<Value> = items
            .into_iter()
            .filter(|item| item_id(item) != Some(id))
            .collect();
        if kept.len() == before {
            return Ok(false);
        }

        self.pending.replace_sequence(&committed, section, kept)?;
        debug!(section, item = %id, "item removed");
        Ok(true)
    }

    pub fn clear_field(&self, section: &str, field: &str) -> bool {
        self.pending.clear_field(section, field)
    }

    pub fn clear_item_field(&self, section: &str, index: usize, field: &str) -> bool {
        self.pending.clear_item_field(section, index, field)
    }

    pub fn clear_section(&self, section: &str) -> bool {
        self.pending.clear_section(section)
    }

    /// Throw away every unsaved edit
    pub fn clear_all(&self) -> bool {
        self.pending.clear_all()
    }

    // Commits

    /// Commit a shallow patch directly (the "save on Enter" path).
    ///
    /// On success the pending keys the patch covered are dropped.
    pub async fn commit(&self, patch: DocumentPatch) -> SyncResult<()> {
        self.live()?;
        self.ensure_slug_confirmed(&patch)?;
        self.store.commit(patch.clone()).await?;
        self.pending.clear_patched(&patch);
        Ok(())
    }

    /// Commit the pending value of one record field
    pub async fn commit_field(&self, section: &str, field: &str) -> SyncResult<bool> {
        self.live()?;
        let in_commit = self.pending.snapshot().only_field(section, field);
        let Some(patch) = in_commit.patch_for_field(&self.store.committed(), section, field)
        else {
            return Ok(false);
        };
        self.commit_pending(patch, &in_commit).await?;
        Ok(true)
    }

    /// Commit everything pending under one top-level key
    pub async fn commit_section(&self, section: &str) -> SyncResult<bool> {
        self.live()?;
        let in_commit = self.pending.snapshot().only_section(section);
        let Some(patch) = in_commit.patch_for_section(&self.store.committed(), section) else {
            return Ok(false);
        };
        self.commit_pending(patch, &in_commit).await?;
        Ok(true)
    }

    /// Commit the whole pending set, including a previewed template.
    ///
    /// The template overlay is cleared only when the commit succeeds.
    pub async fn save_all(&self) -> SyncResult<()> {
        self.live()?;
        let in_commit = self.pending.snapshot();
        let mut patch = in_commit.patch_all(&self.store.committed());
        let previewed = self.template.current();
        if let Some(template_id) = &previewed {
            patch.insert(ACTIVE_TEMPLATE_ID, Value::String(template_id.clone()));
        }
        if patch.is_empty() {
            return Ok(());
        }

        self.commit_pending(patch, &in_commit).await?;
        if previewed.is_some() && self.template.current() == previewed {
            self.template.clear();
        }
        Ok(())
    }

    async fn commit_pending(
        &self,
        patch: DocumentPatch,
        in_commit: &PendingChanges,
    ) -> SyncResult<()> {
        self.ensure_slug_confirmed(&patch)?;
        let result = self.store.commit(patch).await;
        match &result {
            Ok(()) => self.pending.subtract(in_commit),
            Err(err) if err.is_retryable() => {
                warn!(identity = %self.identity, error = %err, "save failed, edits kept");
            }
            Err(_) => {}
        }
        result
    }

    /// A patch changing the slug needs a matching `Available` result
    fn ensure_slug_confirmed(&self, patch: &DocumentPatch) -> SyncResult<()> {
        let Some(slug) = patch
            .get(SLUG_SECTION)
            .and_then(|section| section.get(SLUG_FIELD))
            .and_then(Value::as_str)
        else {
            return Ok(());
        };
        if slug.is_empty() || self.store.committed().slug() == Some(slug) {
            return Ok(());
        }
        match self.validator.state() {
            ValidationState::Available { value } if value == slug => Ok(()),
            _ => Err(SyncError::SlugNotConfirmed(slug.to_string())),
        }
    }

    // Slug validation

    /// Run the slug checks for a value without recording it as pending
    pub fn check_slug(&self, value: &str) -> ValidationState {
        self.validator.on_change(value)
    }

    pub fn slug_state(&self) -> ValidationState {
        self.validator.state()
    }

    pub fn subscribe_slug(&self) -> watch::Receiver<ValidationState> {
        self.validator.subscribe()
    }

    // Template preview

    pub fn preview_template(&self, template_id: impl Into<String>) -> SyncResult<bool> {
        self.live()?;
        Ok(self.template.preview(template_id))
    }

    pub fn previewed_template(&self) -> Option<String> {
        self.template.current()
    }

    /// Make the previewed template the active one.
    ///
    /// Without a preview this commits a pending `activeTemplateId`, if any.
    pub async fn save_template(&self) -> SyncResult<bool> {
        self.live()?;
        let Some(template_id) = self.template.current() else {
            return self.commit_section(ACTIVE_TEMPLATE_ID).await;
        };

        let patch = DocumentPatch::new().with(ACTIVE_TEMPLATE_ID, Value::String(template_id.clone()));
        self.store.commit(patch.clone()).await?;
        self.pending.clear_patched(&patch);
        if self.template.current().as_deref() == Some(template_id.as_str()) {
            self.template.clear();
        }
        info!(identity = %self.identity, template = %template_id, "template saved");
        Ok(true)
    }

    /// Drop the template preview (navigating away from the picker)
    pub fn discard_template_preview(&self) -> bool {
        self.template.clear()
    }

    // Rendering surface

    /// The surface signalled it finished loading
    pub fn surface_ready(&self) -> Result<(), SurfaceError> {
        let preview = self.preview.lock().unwrap_or_else(PoisonError::into_inner);
        match preview.as_ref() {
            Some(preview) => preview.surface_ready(),
            None => Err(SurfaceError::Detached),
        }
    }

    /// Tear the session down. Idempotent.
    pub fn end(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(mut reconciler) = self
            .reconciler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reconciler.stop();
        }
        if let Some(mut preview) = self
            .preview
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            preview.shutdown();
        }

        self.validator.reset();
        self.template.clear();
        self.pending.clear_all();
        self.store.reset();

        info!(identity = %self.identity, session = %self.id, "editor session ended");
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

impl Drop for EditorSession {
    fn drop(&mut self) {
        self.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preview::SurfaceMessage;
    use crate::test_support::{owner, recording_surface, recv_until, FakeBackend};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn session(
        backend: &Arc<FakeBackend>,
    ) -> (EditorSession, mpsc::UnboundedReceiver<SurfaceMessage>) {
        let (surface, rx) = recording_surface();
        let config = EngineConfig {
            slug_debounce: Duration::from_millis(20),
            ..EngineConfig::default()
        };
        let session = EditorSession::start(owner("alice"), backend.services(), surface, config)
            .await
            .unwrap();
        (session, rx)
    }

    #[tokio::test]
    async fn test_start_creates_document_and_pushes_snapshot() {
        let backend = FakeBackend::new();
        let (session, mut rx) = session(&backend).await;

        let first = recv_until(&mut rx, |_| true).await;

        assert_eq!(first.kind(), "DATA_UPDATE");
        assert_eq!(first.data(), &session.committed());
        assert!(backend.stored(session.identity()).is_some());
        assert_eq!(backend.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_commit_field_persists_and_clears_pending() {
        let backend = FakeBackend::new();
        let (session, _rx) = session(&backend).await;

        session
            .set_pending("couple", "partnerOne", json!("Alex"))
            .unwrap();
        session
            .set_pending("couple", "partnerTwo", json!("Sam"))
            .unwrap();
        assert!(session.commit_field("couple", "partnerOne").await.unwrap());

        let stored = backend.stored(session.identity()).unwrap();
        assert_eq!(stored["couple"]["partnerOne"], json!("Alex"));
        assert_eq!(stored["couple"]["partnerTwo"], json!(""));
        assert_eq!(session.pending().field("couple", "partnerOne"), None);
        assert_eq!(session.pending().field("couple", "partnerTwo"), Some(&json!("Sam")));
        assert!(!session.commit_field("couple", "partnerOne").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_save_keeps_pending_and_rolls_back() {
        let backend = FakeBackend::new();
        let (session, _rx) = session(&backend).await;
        let before = session.committed();
        session.set_pending("story", "title", json!("Ours")).unwrap();

        backend.fail_persist.store(true, Ordering::SeqCst);
        let err = session.save_all().await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(session.committed(), before);
        assert_eq!(session.pending().field("story", "title"), Some(&json!("Ours")));

        backend.fail_persist.store(false, Ordering::SeqCst);
        session.save_all().await.unwrap();
        assert!(session.pending().is_empty());
        assert_eq!(
            session.committed().field("story", "title"),
            Some(&json!("Ours"))
        );
    }

    #[tokio::test]
    async fn test_direct_commit_drops_covered_pending_keys() {
        let backend = FakeBackend::new();
        let (session, _rx) = session(&backend).await;
        session.set_pending("story", "title", json!("Draft")).unwrap();

        session
            .commit(DocumentPatch::new().with("story", json!({ "title": "Final", "content": "" })))
            .await
            .unwrap();

        assert!(session.pending().is_empty());
        assert_eq!(session.snapshot().field("story", "title"), Some(&json!("Final")));
    }

    #[tokio::test]
    async fn test_add_and_remove_items() {
        let backend = FakeBackend::new();
        let (session, _rx) = session(&backend).await;

        let id = session.add_item("gallery").unwrap();
        session
            .set_pending_item("gallery", 0, "url", json!("https://img/1.jpg"))
            .unwrap();
        let snapshot = session.snapshot();
        assert_eq!(snapshot.sequence("gallery").len(), 1);
        assert_eq!(item_id(&snapshot.sequence("gallery")[0]), Some(id.as_str()));
        assert_eq!(snapshot.item_field("gallery", 0, "url"), Some(&json!("https://img/1.jpg")));

        assert!(session.commit_section("gallery").await.unwrap());
        assert_eq!(session.committed().sequence("gallery").len(), 1);

        assert!(session.remove_item("gallery", &id).unwrap());
        assert!(!session.remove_item("gallery", "missing").unwrap());
        assert!(session.snapshot().sequence("gallery").is_empty());
        assert!(matches!(
            session.add_item("couple"),
            Err(SyncError::NotASequence(_))
        ));
    }

    #[tokio::test]
    async fn test_template_preview_save_and_discard() {
        let backend = FakeBackend::new();
        let (session, mut rx) = session(&backend).await;

        session.preview_template("model_3").unwrap();
        assert_eq!(session.snapshot().active_template_id(), Some("model_3"));
        assert_eq!(session.committed().active_template_id(), Some("model_1"));

        session.surface_ready().unwrap();
        let message = recv_until(&mut rx, |m| m.kind() == "SURFACE_CHANGED").await;
        assert!(matches!(
            message,
            SurfaceMessage::SurfaceChanged { template_id: Some(ref t), .. } if t == "model_3"
        ));

        session.discard_template_preview();
        assert_eq!(session.snapshot().active_template_id(), Some("model_1"));

        session.preview_template("model_2").unwrap();
        assert!(session.save_template().await.unwrap());
        assert_eq!(session.previewed_template(), None);
        assert_eq!(session.committed().active_template_id(), Some("model_2"));
    }

    #[tokio::test]
    async fn test_pending_template_override_then_clear_all() {
        let backend = FakeBackend::new();
        let (session, _rx) = session(&backend).await;

        session
            .set_pending_value(ACTIVE_TEMPLATE_ID, json!("model_3"))
            .unwrap();
        assert_eq!(session.snapshot().active_template_id(), Some("model_3"));

        session.clear_all();
        assert_eq!(session.snapshot().active_template_id(), Some("model_1"));
    }

    #[tokio::test]
    async fn test_slug_must_be_confirmed_before_commit() {
        let backend = FakeBackend::new();
        let (session, _rx) = session(&backend).await;

        session
            .set_pending(SLUG_SECTION, SLUG_FIELD, json!("alex-and-sam"))
            .unwrap();
        let err = session.commit_field(SLUG_SECTION, SLUG_FIELD).await.unwrap_err();
        assert!(matches!(err, SyncError::SlugNotConfirmed(_)));

        let mut rx = session.subscribe_slug();
        while !rx.borrow_and_update().is_settled() {
            rx.changed().await.unwrap();
        }
        assert_eq!(
            session.slug_state(),
            ValidationState::Available {
                value: "alex-and-sam".into()
            }
        );

        assert!(session.commit_field(SLUG_SECTION, SLUG_FIELD).await.unwrap());
        assert_eq!(session.committed().slug(), Some("alex-and-sam"));
    }

    #[tokio::test]
    async fn test_end_tears_everything_down() {
        let backend = FakeBackend::new();
        let (session, _rx) = session(&backend).await;
        session.set_pending("story", "title", json!("x")).unwrap();

        session.end();
        session.end();

        assert!(session.is_ended());
        assert_eq!(backend.subscriber_count(), 0);
        assert!(session.pending().is_empty());
        assert!(matches!(
            session.set_pending("story", "title", json!("y")),
            Err(SyncError::SessionEnded)
        ));
        assert!(matches!(
            session.save_all().await,
            Err(SyncError::SessionEnded)
        ));
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let backend = FakeBackend::new();
        let (session, _rx) = session(&backend).await;
        assert_eq!(backend.subscriber_count(), 1);

        drop(session);

        assert_eq!(backend.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_write_during_start_is_not_lost() {
        let backend = FakeBackend::new();
        let alice = owner("alice");
        backend.seed(&alice, json!({ "story": { "title": "Before" } }));
        *backend.remote_during_load.lock().unwrap() =
            Some(json!({ "story": { "title": "Meanwhile" } }));

        let (session, _rx) = session(&backend).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while session.committed().field("story", "title") != Some(&json!("Meanwhile")) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("remote write made during load was dropped");
    }

    #[tokio::test]
    async fn test_failed_start_unsubscribes() {
        let backend = FakeBackend::new();
        backend.fail_persist.store(true, Ordering::SeqCst);
        let (surface, _rx) = recording_surface();

        let result =
            EditorSession::start(owner("alice"), backend.services(), surface, EngineConfig::default())
                .await;

        assert!(matches!(result, Err(SyncError::NotFound { .. })));
        assert_eq!(backend.subscriber_count(), 0);
    }
}
