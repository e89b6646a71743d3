//! The set of watched hot-folder roots.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use super::recursive::RecursiveWatcher;
use super::types::{EventSink, WatchError, WatchEvent, WatcherConfig};

/// Result of adding one path.
#[derive(Debug)]
pub struct WatchOutcome {
    /// The path as given by the caller.
    pub path: PathBuf,
    pub result: Result<(), WatchError>,
}

#[derive(Default)]
struct Roots {
    active: HashMap<PathBuf, RecursiveWatcher>,
    /// Roots whose tree is still being attached.
    starting: HashSet<PathBuf>,
}

impl Roots {
    /// Why `root` cannot be watched next to the current roots, if anything.
    ///
    /// Watched trees never overlap: one file is announced by one tree.
    fn conflict(&self, root: &Path) -> Option<WatchError> {
        let existing = self.active.keys().chain(self.starting.iter());
        for watched in existing {
            if root.starts_with(watched) {
                return Some(WatchError::AlreadyWatched(root.to_path_buf()));
            }
            if watched.starts_with(root) {
                return Some(WatchError::ContainsWatched {
                    path: root.to_path_buf(),
                    root: watched.clone(),
                });
            }
        }
        None
    }
}

/// Where one requested path stands before its tree is attached.
enum Stage {
    Rejected(WatchError),
    Reserved(PathBuf),
}

/// Independently addable and removable watched roots.
///
/// Every root publishes into the receiver returned by [`WatchRegistry::new`].
pub struct WatchRegistry {
    config: WatcherConfig,
    sink: EventSink,
    roots: Mutex<Roots>,
}

impl WatchRegistry {
    pub fn new(config: WatcherConfig) -> (Self, mpsc::UnboundedReceiver<WatchEvent>) {
        let (sink, rx) = mpsc::unbounded_channel();
        let registry = Self {
            config,
            sink,
            roots: Mutex::new(Roots::default()),
        };
        (registry, rx)
    }

    /// Start watching every path concurrently.
    ///
    /// One outcome per input path, in input order. A failing path does not
    /// affect the others. A path inside a watched root, or containing one,
    /// is rejected; within one call the shallowest path wins.
    pub async fn add(&self, paths: Vec<PathBuf>) -> Vec<WatchOutcome> {
        let resolved = join_all(paths.iter().map(tokio::fs::canonicalize)).await;
        let stages = self.reserve(&paths, resolved).await;

        let attempts = paths.into_iter().zip(stages).map(|(path, stage)| async move {
            let result = match stage {
                Stage::Rejected(e) => Err(e),
                Stage::Reserved(root) => self.start(root).await,
            };
            match &result {
                Ok(()) => info!(path = %path.display(), "Watching hot folder"),
                Err(e @ WatchError::AlreadyWatched(_)) => {
                    info!(path = %path.display(), reason = %e, "Hot folder already watched")
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to watch hot folder"),
            }
            WatchOutcome { path, result }
        });
        join_all(attempts).await
    }

    /// Claim the resolved roots under one lock, shallowest first.
    async fn reserve(
        &self,
        paths: &[PathBuf],
        resolved: Vec<std::io::Result<PathBuf>>,
    ) -> Vec<Stage> {
        let mut stages: Vec<Stage> = paths
            .iter()
            .zip(resolved)
            .map(|(path, root)| match root {
                Ok(root) => Stage::Reserved(root),
                Err(e) => Stage::Rejected(WatchError::io(path, e)),
            })
            .collect();

        let mut order: Vec<(usize, usize)> = stages
            .iter()
            .enumerate()
            .filter_map(|(index, stage)| match stage {
                Stage::Reserved(root) => Some((root.components().count(), index)),
                Stage::Rejected(_) => None,
            })
            .collect();
        order.sort();

        let mut roots = self.roots.lock().await;
        for (_, index) in order {
            let Stage::Reserved(root) = &stages[index] else {
                continue;
            };
            match roots.conflict(root) {
                Some(e) => stages[index] = Stage::Rejected(e),
                None => {
                    roots.starting.insert(root.clone());
                }
            }
        }
        stages
    }

    async fn start(&self, root: PathBuf) -> Result<(), WatchError> {
        let started = RecursiveWatcher::start(root.clone(), &self.config, self.sink.clone()).await;

        let mut roots = self.roots.lock().await;
        roots.starting.remove(&root);
        let watcher = started?;
        roots.active.insert(root, watcher);
        Ok(())
    }

    /// Stop watching the given roots, or every root with `None`.
    ///
    /// Returns the roots actually removed.
    pub async fn remove(&self, paths: Option<&[PathBuf]>) -> Vec<PathBuf> {
        let mut roots = self.roots.lock().await;

        let doomed: Vec<PathBuf> = match paths {
            None => roots.active.keys().cloned().collect(),
            Some(paths) => {
                let mut doomed = Vec::new();
                for path in paths {
                    let root = tokio::fs::canonicalize(path)
                        .await
                        .unwrap_or_else(|_| path.clone());
                    if roots.active.contains_key(&root) {
                        doomed.push(root);
                    }
                }
                doomed
            }
        };

        for root in &doomed {
            if let Some(watcher) = roots.active.remove(root) {
                watcher.close();
                info!(path = %root.display(), "Stopped watching hot folder");
            }
        }
        doomed
    }

    /// Watched roots, sorted.
    pub async fn roots(&self) -> Vec<PathBuf> {
        let roots = self.roots.lock().await;
        let mut paths: Vec<PathBuf> = roots.active.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Number of directories watched across all roots.
    pub async fn watched_directories(&self) -> usize {
        let roots = self.roots.lock().await;
        roots
            .active
            .values()
            .map(|w| w.watched_directories().len())
            .sum()
    }
}

impl std::fmt::Debug for WatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
