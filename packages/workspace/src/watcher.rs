use crate::backend::LocalBackend;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Failed to create watcher: {0}")]
    CreateError(#[from] notify::Error),

    #[error("backend has no data directory to watch")]
    NoDataDir,
}

pub type WatcherResult<T> = Result<T, WatcherError>;

/// Republishes document files edited outside the server as remote changes
pub struct DataDirWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl DataDirWatcher {
    pub fn spawn(backend: Arc<LocalBackend>) -> WatcherResult<Self> {
        let path: PathBuf = backend
            .data_dir()
            .ok_or(WatcherError::NoDataDir)?
            .to_path_buf();
        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default(),
        )?;

        watcher.watch(&path, RecursiveMode::NonRecursive)?;
        debug!(path = %path.display(), "watching data directory");

        let task = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                let event = match res {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(error = %err, "data directory watch error");
                        continue;
                    }
                };
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    continue;
                }
                for path in &event.paths {
                    if let Err(err) = backend.ingest_file(path) {
                        // partial writes show up here as parse errors
                        debug!(path = %path.display(), error = %err, "could not ingest file");
                    }
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for DataDirWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use std::time::Duration;
    use vows_common::OwnerIdentity;
    use vows_editor::RealtimeService;

    #[tokio::test]
    async fn test_external_edit_is_published() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(LocalBackend::with_data_dir(dir.path()).unwrap());
        let alice = OwnerIdentity::new("alice").unwrap();
        let mut sub = backend.subscribe(&alice).await.unwrap();
        let _watcher = DataDirWatcher::spawn(backend.clone()).unwrap();

        let path = dir.path().join("alice.json");
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            fs::write(path, r#"{ "story": { "title": "From disk" } }"#).unwrap();
        });

        let change = tokio::time::timeout(Duration::from_secs(5), sub.changes.recv())
            .await
            .expect("no change published")
            .unwrap();
        writer.await.unwrap();

        assert_eq!(change.identity, alice);
        assert_eq!(change.document, json!({ "story": { "title": "From disk" } }));
    }

    #[test]
    fn test_requires_data_dir() {
        let backend = Arc::new(LocalBackend::in_memory());
        assert!(matches!(
            DataDirWatcher::spawn(backend),
            Err(WatcherError::NoDataDir)
        ));
    }
}
