//! File-existence watcher: polls completed tasks for "is it still there?"
//! and emits a change only when the observed state flips.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::metadata::MetadataStore;
use crate::Result;

const DEFAULT_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub enum WatchedItem {
    LocalPath(PathBuf),
    RemoteFolder(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistenceChange {
    pub now_exists: bool,
}

/// A sink receiving a change event whenever a watched item's existence
/// flips relative to its last observation.
pub trait ExistenceSink: Send + Sync {
    fn on_change(&self, task_id: &str, change: ExistenceChange);
}

struct Watched {
    item: WatchedItem,
    last_observed: Option<bool>,
}

/// Polls every registered item on a fixed interval. Cheap to clone (`Arc`
/// inside); `register`/`unregister` can be called from any task.
pub struct FileExistenceWatcher {
    metadata: Arc<MetadataStore>,
    items: Arc<Mutex<HashMap<String, Watched>>>,
    poll_interval: Duration,
}

impl FileExistenceWatcher {
    pub fn new(metadata: Arc<MetadataStore>, poll_interval_ms: u64) -> Self {
        Self {
            metadata,
            items: Arc::new(Mutex::new(HashMap::new())),
            poll_interval: if poll_interval_ms == 0 {
                DEFAULT_POLL
            } else {
                Duration::from_millis(poll_interval_ms)
            },
        }
    }

    pub async fn watch_local_path(&self, task_id: &str, path: PathBuf) {
        self.items.lock().await.insert(
            task_id.to_string(),
            Watched {
                item: WatchedItem::LocalPath(path),
                last_observed: None,
            },
        );
    }

    pub async fn watch_remote_folder(&self, task_id: &str, folder_id: i64) {
        self.items.lock().await.insert(
            task_id.to_string(),
            Watched {
                item: WatchedItem::RemoteFolder(folder_id),
                last_observed: None,
            },
        );
    }

    pub async fn unwatch(&self, task_id: &str) {
        self.items.lock().await.remove(task_id);
    }

    /// Runs the poll loop until `cancel` fires. Intended to be spawned once
    /// per engine instance.
    pub async fn run(&self, sink: Arc<dyn ExistenceSink>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            if let Err(e) = self.poll_once(&sink).await {
                tracing::warn!(error = %e, "file existence watcher poll failed");
            }
        }
    }

    async fn poll_once(&self, sink: &Arc<dyn ExistenceSink>) -> Result<()> {
        let mut items = self.items.lock().await;
        for (task_id, watched) in items.iter_mut() {
            let exists = match &watched.item {
                WatchedItem::LocalPath(path) => path.exists(),
                WatchedItem::RemoteFolder(folder_id) => self.metadata.folder_exists(*folder_id).await?,
            };
            if watched.last_observed != Some(exists) {
                watched.last_observed = Some(exists);
                sink.on_change(task_id, ExistenceChange { now_exists: exists });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingSink {
        changes: std::sync::Mutex<Vec<(String, bool)>>,
    }

    impl ExistenceSink for CountingSink {
        fn on_change(&self, task_id: &str, change: ExistenceChange) {
            self.changes.lock().unwrap().push((task_id.to_string(), change.now_exists));
        }
    }

    async fn new_watcher() -> (tempfile::TempDir, FileExistenceWatcher) {
        let dir = tempfile::tempdir().unwrap();
        let metadata = Arc::new(MetadataStore::open(&dir.path().join("meta.db")).await.unwrap());
        (dir, FileExistenceWatcher::new(metadata, 10))
    }

    #[tokio::test]
    async fn emits_only_on_transition() {
        let (dir, watcher) = new_watcher().await;
        let path = dir.path().join("out.bin");
        std::fs::write(&path, b"x").unwrap();
        watcher.watch_local_path("dl1", path.clone()).await;

        let sink = Arc::new(CountingSink { changes: std::sync::Mutex::new(Vec::new()) });
        watcher.poll_once(&(sink.clone() as Arc<dyn ExistenceSink>)).await.unwrap();
        watcher.poll_once(&(sink.clone() as Arc<dyn ExistenceSink>)).await.unwrap();
        assert_eq!(sink.changes.lock().unwrap().len(), 1, "second poll observes no change, no event");

        std::fs::remove_file(&path).unwrap();
        watcher.poll_once(&(sink.clone() as Arc<dyn ExistenceSink>)).await.unwrap();
        let changes = sink.changes.lock().unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1], ("dl1".to_string(), false));
    }

    #[tokio::test]
    async fn watches_remote_folder_existence() {
        let (_dir, watcher) = new_watcher().await;
        let folder_id = watcher.metadata.add_folder(watcher.metadata.root_folder_id, "f").await.unwrap();
        watcher.watch_remote_folder("up1", folder_id).await;

        let sink = Arc::new(CountingSink { changes: std::sync::Mutex::new(Vec::new()) });
        watcher.poll_once(&(sink.clone() as Arc<dyn ExistenceSink>)).await.unwrap();
        assert_eq!(sink.changes.lock().unwrap()[0], ("up1".to_string(), true));

        watcher.metadata.remove_folder(folder_id).await.unwrap();
        watcher.poll_once(&(sink.clone() as Arc<dyn ExistenceSink>)).await.unwrap();
        let changes = sink.changes.lock().unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1], ("up1".to_string(), false));
    }
}
