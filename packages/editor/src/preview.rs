//! # Preview Channel
//!
//! One-way bridge from the engine to the rendering surface. Any change to
//! the committed document, the pending overlay or the template overlay
//! results in a `DATA_UPDATE` carrying the fully merged snapshot. When the
//! surface reports it is ready, it receives `SURFACE_CHANGED` with the
//! template to render and the same snapshot.
//!
//! The push task waits on the three revision channels at once. Triggers that
//! land before the task wakes collapse into a single push, and every push is
//! composed from the current state, so the surface never sees a half-merged
//! document.

use crate::errors::SurfaceError;
use crate::pending::PendingTracker;
use crate::store::DocumentStore;
use crate::template::TemplatePreview;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use vows_common::{Document, ACTIVE_TEMPLATE_ID};

/// Message posted to the rendering surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SurfaceMessage {
    DataUpdate {
        data: Document,
    },
    SurfaceChanged {
        #[serde(rename = "templateId")]
        template_id: Option<String>,
        data: Document,
    },
}

impl SurfaceMessage {
    pub fn data(&self) -> &Document {
        match self {
            SurfaceMessage::DataUpdate { data } | SurfaceMessage::SurfaceChanged { data, .. } => {
                data
            }
        }
    }

    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            SurfaceMessage::DataUpdate { .. } => "DATA_UPDATE",
            SurfaceMessage::SurfaceChanged { .. } => "SURFACE_CHANGED",
        }
    }
}

/// Something that can receive surface messages
pub trait SurfaceEndpoint: Send + Sync {
    fn post(&self, message: SurfaceMessage) -> Result<(), SurfaceError>;
}

impl SurfaceEndpoint for mpsc::UnboundedSender<SurfaceMessage> {
    fn post(&self, message: SurfaceMessage) -> Result<(), SurfaceError> {
        self.send(message).map_err(|_| SurfaceError::Detached)
    }
}

impl SurfaceEndpoint for broadcast::Sender<SurfaceMessage> {
    fn post(&self, message: SurfaceMessage) -> Result<(), SurfaceError> {
        self.send(message).map(|_| ()).map_err(|_| SurfaceError::Detached)
    }
}

/// Read side of the three state holders a snapshot is composed from
#[derive(Clone)]
pub struct SnapshotSource {
    store: DocumentStore,
    pending: PendingTracker,
    template: TemplatePreview,
}

impl SnapshotSource {
    pub fn new(store: DocumentStore, pending: PendingTracker, template: TemplatePreview) -> Self {
        Self {
            store,
            pending,
            template,
        }
    }

    /// Pending merged over committed, with the template overlay on top
    pub fn compose(&self) -> Document {
        let committed = self.store.committed();
        let mut merged = self.pending.merge(&committed);
        if let Some(template_id) = self.template.current() {
            merged.set(ACTIVE_TEMPLATE_ID, Value::String(template_id));
        }
        merged
    }

    fn receivers(&self) -> [watch::Receiver<u64>; 3] {
        [
            self.store.subscribe(),
            self.pending.subscribe(),
            self.template.subscribe(),
        ]
    }
}

pub struct PreviewChannel {
    source: SnapshotSource,
    surface: Arc<dyn SurfaceEndpoint>,
    task: Option<JoinHandle<()>>,
}

impl PreviewChannel {
    /// Start pushing updates to `surface`
    pub fn spawn(source: SnapshotSource, surface: Arc<dyn SurfaceEndpoint>) -> Self {
        let [committed, pending, template] = source.receivers();
        let task = tokio::spawn(push_loop(
            source.clone(),
            surface.clone(),
            committed,
            pending,
            template,
        ));
        Self {
            source,
            surface,
            task: Some(task),
        }
    }

    pub fn compose_snapshot(&self) -> Document {
        self.source.compose()
    }

    /// Push a `DATA_UPDATE` right away, outside the change-driven loop
    pub fn push_now(&self) -> Result<(), SurfaceError> {
        self.surface.post(SurfaceMessage::DataUpdate {
            data: self.source.compose(),
        })
    }

    /// The surface finished loading; send it the template and data to render
    pub fn surface_ready(&self) -> Result<(), SurfaceError> {
        let data = self.source.compose();
        let template_id = data.active_template_id().map(str::to_string);
        debug!(template = ?template_id, "surface ready");
        self.surface
            .post(SurfaceMessage::SurfaceChanged { template_id, data })
    }

    pub fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for PreviewChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn push_loop(
    source: SnapshotSource,
    surface: Arc<dyn SurfaceEndpoint>,
    mut committed: watch::Receiver<u64>,
    mut pending: watch::Receiver<u64>,
    mut template: watch::Receiver<u64>,
) {
    loop {
        let trigger = tokio::select! {
            r = committed.changed() => r.map(|_| "committed"),
            r = pending.changed() => r.map(|_| "pending"),
            r = template.changed() => r.map(|_| "template"),
        };
        let Ok(trigger) = trigger else {
            break;
        };

        committed.borrow_and_update();
        pending.borrow_and_update();
        template.borrow_and_update();

        let message = SurfaceMessage::DataUpdate {
            data: source.compose(),
        };
        match surface.post(message) {
            Ok(()) => trace!(trigger, "pushed data update"),
            Err(err) => debug!(trigger, error = %err, "data update not delivered"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{owner, recording_surface, recv_until, DetachedSurface, FakeBackend};
    use serde_json::json;
    use vows_common::{DocumentPatch, IdGenerator};

    async fn source() -> (Arc<FakeBackend>, SnapshotSource) {
        let backend = FakeBackend::new();
        let ids = Arc::new(IdGenerator::from_seed("v"));
        let store = DocumentStore::new(backend.clone(), ids.clone(), "model_1");
        store.load(&owner("alice")).await.unwrap();
        let source = SnapshotSource::new(store, PendingTracker::new(ids), TemplatePreview::new());
        (backend, source)
    }

    #[test]
    fn test_wire_format() {
        let data = Document::from_value(json!({ "activeTemplateId": "model_2" })).unwrap();

        let update = serde_json::to_value(SurfaceMessage::DataUpdate { data: data.clone() }).unwrap();
        assert_eq!(
            update,
            json!({ "type": "DATA_UPDATE", "data": { "activeTemplateId": "model_2" } })
        );

        let changed = serde_json::to_value(SurfaceMessage::SurfaceChanged {
            template_id: Some("model_2".into()),
            data,
        })
        .unwrap();
        assert_eq!(
            changed,
            json!({
                "type": "SURFACE_CHANGED",
                "templateId": "model_2",
                "data": { "activeTemplateId": "model_2" }
            })
        );
    }

    #[tokio::test]
    async fn test_pending_edit_pushes_merged_snapshot() {
        let (_backend, source) = source().await;
        let (surface, mut rx) = recording_surface();
        let _channel = PreviewChannel::spawn(source.clone(), surface);

        source
            .pending
            .set_pending(
                &source.store.committed(),
                "couple",
                "partnerOne",
                json!("Alex"),
            )
            .unwrap();

        let message = recv_until(&mut rx, |m| {
            m.data().field("couple", "partnerOne") == Some(&json!("Alex"))
        })
        .await;
        assert_eq!(message.kind(), "DATA_UPDATE");
        assert_eq!(message.data().field("story", "title"), Some(&json!("Our Story")));
    }

    #[tokio::test]
    async fn test_commit_pushes_update() {
        let (_backend, source) = source().await;
        let (surface, mut rx) = recording_surface();
        let _channel = PreviewChannel::spawn(source.clone(), surface);

        source
            .store
            .commit(DocumentPatch::new().with("story", json!({ "title": "Saved" })))
            .await
            .unwrap();

        recv_until(&mut rx, |m| {
            m.data().field("story", "title") == Some(&json!("Saved"))
        })
        .await;
    }

    #[tokio::test]
    async fn test_template_overlay_wins_over_pending_and_committed() {
        let (_backend, source) = source().await;
        let (surface, mut rx) = recording_surface();
        let channel = PreviewChannel::spawn(source.clone(), surface);

        source
            .pending
            .set_pending_value(&source.store.committed(), ACTIVE_TEMPLATE_ID, json!("model_2"))
            .unwrap();
        assert_eq!(channel.compose_snapshot().active_template_id(), Some("model_2"));

        source.template.preview("model_3");
        recv_until(&mut rx, |m| m.data().active_template_id() == Some("model_3")).await;

        source.template.clear();
        recv_until(&mut rx, |m| m.data().active_template_id() == Some("model_2")).await;
    }

    #[tokio::test]
    async fn test_surface_ready_sends_surface_changed() {
        let (_backend, source) = source().await;
        let (surface, mut rx) = recording_surface();
        let channel = PreviewChannel::spawn(source.clone(), surface);
        source.template.preview("model_4");

        channel.surface_ready().unwrap();

        let message = recv_until(&mut rx, |m| m.kind() == "SURFACE_CHANGED").await;
        assert_eq!(
            message,
            SurfaceMessage::SurfaceChanged {
                template_id: Some("model_4".into()),
                data: source.compose(),
            }
        );
    }

    #[tokio::test]
    async fn test_detached_surface_does_not_stop_channel() {
        let (_backend, source) = source().await;
        let channel = PreviewChannel::spawn(source.clone(), Arc::new(DetachedSurface));

        source.template.preview("model_2");
        tokio::task::yield_now().await;

        assert_eq!(channel.push_now(), Err(SurfaceError::Detached));
        assert!(channel.task.as_ref().is_some_and(|t| !t.is_finished()));
    }
}
