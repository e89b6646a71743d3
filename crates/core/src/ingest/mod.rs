//! Hands settled hot-folder files to the scheduler.

use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::HotFolderConfig;
use crate::scheduler::{PublishScheduler, SchedulerError, SubmitRequest};
use crate::watcher::WatchEvent;

/// Consumes watch events and submits every created file found under a
/// configured hot folder.
pub struct HotFolderIngest {
    /// Hot folders with resolved roots, deepest first.
    folders: Vec<(PathBuf, HotFolderConfig)>,
    scheduler: PublishScheduler,
}

impl HotFolderIngest {
    pub fn new(hot_folders: Vec<HotFolderConfig>, scheduler: PublishScheduler) -> Self {
        let mut folders: Vec<(PathBuf, HotFolderConfig)> = hot_folders
            .into_iter()
            .map(|folder| {
                // Watch events carry canonical paths.
                let root = std::fs::canonicalize(&folder.path).unwrap_or_else(|_| folder.path.clone());
                (root, folder)
            })
            .collect();
        folders.sort_by(|a, b| {
            b.0.components()
                .count()
                .cmp(&a.0.components().count())
        });

        Self { folders, scheduler }
    }

    /// Hot folder owning `path`; the deepest root wins.
    pub fn folder_for(&self, path: &Path) -> Option<&HotFolderConfig> {
        self.folders
            .iter()
            .find(|(root, _)| path.starts_with(root))
            .map(|(_, folder)| folder)
    }

    /// Process events until the channel closes.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<WatchEvent>) {
        info!(folders = self.folders.len(), "Hot folder ingest started");
        while let Some(event) = rx.recv().await {
            self.handle(event).await;
        }
        info!("Hot folder ingest stopped");
    }

    async fn handle(&self, event: WatchEvent) {
        match event {
            WatchEvent::Create(path) => self.on_create(path).await,
            WatchEvent::Delete(path) => debug!(path = %path.display(), "Resource removed"),
            WatchEvent::Watch(path) => debug!(path = %path.display(), "Watching directory"),
            WatchEvent::Error { path, message } => {
                warn!(path = %path.display(), error = %message, "Watch error")
            }
        }
    }

    async fn on_create(&self, path: PathBuf) {
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => {}
            Ok(_) => return,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Created resource vanished");
                return;
            }
        }

        let Some(folder) = self.folder_for(&path) else {
            debug!(path = %path.display(), "File outside of any hot folder");
            return;
        };

        let request = SubmitRequest {
            source_path: path.clone(),
            owner: folder.owner.clone(),
            group: folder.group.clone(),
            platform: folder.platform.clone(),
        };

        match self.scheduler.submit(request) {
            Ok(package) => info!(
                package_id = %package.id,
                source = %path.display(),
                "Hot folder package submitted"
            ),
            Err(e @ SchedulerError::Duplicate { .. }) => {
                debug!(source = %path.display(), reason = %e, "Ignoring known package")
            }
            Err(e) => warn!(source = %path.display(), error = %e, "Package rejected"),
        }
    }
}
