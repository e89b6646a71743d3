//! Watches a whole directory tree.
//!
//! One [`DirectoryWatcher`] per directory, keyed by absolute path. A `Create`
//! that resolves to an unwatched directory attaches watchers for it and for
//! everything already inside it; a `Delete` detaches the path and all its
//! descendants.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::directory::DirectoryWatcher;
use super::stability::StabilityTracker;
use super::types::{EventSink, WatchError, WatchEvent, WatcherConfig};
use crate::metrics::{WATCHED_DIRECTORIES, WATCH_EVENTS};

struct Tree {
    root: PathBuf,
    tracker: StabilityTracker,
    /// Sink handed to the per-directory watchers.
    internal: EventSink,
    out: EventSink,
    cancel: CancellationToken,
    watchers: Mutex<HashMap<PathBuf, DirectoryWatcher>>,
}

impl Tree {
    fn watchers(&self) -> MutexGuard<'_, HashMap<PathBuf, DirectoryWatcher>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: WatchEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        WATCH_EVENTS.with_label_values(&[event.kind()]).inc();
        let _ = self.out.send(event);
    }

    fn is_watched(&self, path: &Path) -> bool {
        self.watchers().contains_key(path)
    }

    /// Attach watchers to `top` and every directory below it.
    ///
    /// Failing to watch `top` itself is returned; failures further down are
    /// emitted as `Error` events and the rest of the tree is still attached.
    async fn attach(&self, top: &Path) -> Result<Vec<PathBuf>, WatchError> {
        let mut attached = Vec::new();
        let mut stack = vec![top.to_path_buf()];

        while let Some(dir) = stack.pop() {
            if self.cancel.is_cancelled() {
                break;
            }
            if self.is_watched(&dir) {
                continue;
            }

            match DirectoryWatcher::watch(dir.clone(), self.tracker.clone(), self.internal.clone())
                .await
            {
                Ok(watcher) => {
                    self.watchers().insert(dir.clone(), watcher);
                    WATCHED_DIRECTORIES.inc();
                    attached.push(dir.clone());
                }
                Err(e) if dir == top => return Err(e),
                Err(e) if is_vanished(&e) => continue,
                Err(e) => {
                    self.emit(WatchEvent::Error {
                        path: dir,
                        message: e.to_string(),
                    });
                    continue;
                }
            }

            match subdirectories(&dir).await {
                Ok(children) => stack.extend(children),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => self.emit(WatchEvent::Error {
                    path: dir,
                    message: e.to_string(),
                }),
            }
        }

        Ok(attached)
    }

    /// Close the watcher of `path` and of every directory below it.
    ///
    /// Returns the announced children of the closed watchers, deepest
    /// first: they vanished with the directory.
    fn detach(&self, path: &Path) -> Vec<PathBuf> {
        let mut watchers = self.watchers();
        let doomed: Vec<PathBuf> = watchers
            .keys()
            .filter(|dir| dir.starts_with(path))
            .cloned()
            .collect();

        let mut orphaned = Vec::new();
        for dir in &doomed {
            if let Some(watcher) = watchers.remove(dir) {
                orphaned.extend(watcher.close_announced());
                WATCHED_DIRECTORIES.dec();
            }
        }
        orphaned.sort_by(|a, b| b.cmp(a));
        orphaned
    }

    async fn on_create(&self, path: PathBuf) {
        self.emit(WatchEvent::Create(path.clone()));

        let is_dir = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata.is_dir(),
            Err(_) => false,
        };
        if !is_dir || self.is_watched(&path) {
            return;
        }

        match self.attach(&path).await {
            Ok(attached) => {
                for dir in attached {
                    debug!(path = %dir.display(), "Watching new directory");
                    self.emit(WatchEvent::Watch(dir));
                }
            }
            Err(e) if is_vanished(&e) => {}
            Err(e) => self.emit(WatchEvent::Error {
                path,
                message: e.to_string(),
            }),
        }
    }

    fn on_delete(&self, path: PathBuf) {
        let orphaned = self.detach(&path);
        if !orphaned.is_empty() {
            debug!(
                path = %path.display(),
                orphaned = orphaned.len(),
                "Stopped watching removed directory"
            );
        }
        for child in orphaned {
            self.emit(WatchEvent::Delete(child));
        }
        self.emit(WatchEvent::Delete(path));
    }

    async fn forward(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<WatchEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };

            match event {
                WatchEvent::Create(path) => self.on_create(path).await,
                WatchEvent::Delete(path) => self.on_delete(path),
                WatchEvent::Error { path, message } => {
                    warn!(path = %path.display(), error = %message, "Directory watch degraded");
                    self.emit(WatchEvent::Error { path, message });
                }
                WatchEvent::Watch(path) => self.emit(WatchEvent::Watch(path)),
            }
        }
    }

    fn close(&self) {
        self.cancel.cancel();
        let mut watchers = self.watchers();
        for (_, watcher) in watchers.drain() {
            watcher.close();
            WATCHED_DIRECTORIES.dec();
        }
    }
}

fn is_vanished(error: &WatchError) -> bool {
    match error {
        WatchError::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
        WatchError::Notify(e) => match &e.kind {
            notify::ErrorKind::PathNotFound => true,
            notify::ErrorKind::Io(err) => err.kind() == io::ErrorKind::NotFound,
            _ => false,
        },
        _ => false,
    }
}

async fn subdirectories(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        // Symlinked directories are not followed.
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

/// Emits `Create`/`Delete`/`Watch`/`Error` for a whole tree.
pub struct RecursiveWatcher {
    tree: Arc<Tree>,
}

impl RecursiveWatcher {
    /// Attach to `root` and every directory below it.
    ///
    /// A `Watch` event is emitted for every directory attached, the root
    /// included.
    pub async fn start(
        root: PathBuf,
        config: &WatcherConfig,
        out: EventSink,
    ) -> Result<Self, WatchError> {
        let metadata = tokio::fs::metadata(&root)
            .await
            .map_err(|e| WatchError::io(&root, e))?;
        if !metadata.is_dir() {
            return Err(WatchError::NotADirectory(root));
        }

        let (internal, rx) = mpsc::unbounded_channel();
        let tree = Arc::new(Tree {
            root: root.clone(),
            tracker: StabilityTracker::new(config.quiet_period()),
            internal,
            out,
            cancel: CancellationToken::new(),
            watchers: Mutex::new(HashMap::new()),
        });

        let attached = match tree.attach(&root).await {
            Ok(attached) => attached,
            Err(e) => {
                tree.close();
                return Err(e);
            }
        };
        for dir in attached {
            tree.emit(WatchEvent::Watch(dir));
        }

        tokio::spawn(Arc::clone(&tree).forward(rx));

        debug!(root = %root.display(), "Tree watched");
        Ok(Self { tree })
    }

    pub fn root(&self) -> &Path {
        &self.tree.root
    }

    /// Currently watched directories, sorted.
    pub fn watched_directories(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.tree.watchers().keys().cloned().collect();
        dirs.sort();
        dirs
    }

    /// Close every directory watcher. Nothing is emitted afterwards.
    pub fn close(&self) {
        self.tree.close();
    }
}

impl Drop for RecursiveWatcher {
    fn drop(&mut self) {
        self.tree.close();
    }
}

impl std::fmt::Debug for RecursiveWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecursiveWatcher")
            .field("root", &self.tree.root)
            .field("directories", &self.tree.watchers().len())
            .finish()
    }
}
