//! Transient template preview overlay.
//!
//! Lets the owner try another template on the preview surface without
//! touching the committed or pending document. The overlay takes precedence
//! over `activeTemplateId` until it is cleared or saved.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::debug;

#[derive(Clone)]
pub struct TemplatePreview {
    current: Arc<Mutex<Option<String>>>,
    revision: Arc<watch::Sender<u64>>,
}

impl Default for TemplatePreview {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplatePreview {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            current: Arc::new(Mutex::new(None)),
            revision: Arc::new(revision),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<String>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Show `template_id` on the surface. Returns whether the overlay changed.
    pub fn preview(&self, template_id: impl Into<String>) -> bool {
        let template_id = template_id.into();
        let changed = {
            let mut current = self.lock();
            if current.as_deref() == Some(template_id.as_str()) {
                false
            } else {
                debug!(template = %template_id, "previewing template");
                *current = Some(template_id);
                true
            }
        };
        if changed {
            self.revision.send_modify(|rev| *rev += 1);
        }
        changed
    }

    /// Drop the overlay. Returns whether one was set.
    pub fn clear(&self) -> bool {
        let cleared = self.lock().take().is_some();
        if cleared {
            self.revision.send_modify(|rev| *rev += 1);
        }
        cleared
    }

    pub fn current(&self) -> Option<String> {
        self.lock().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}
