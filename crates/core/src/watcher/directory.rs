//! Watches the direct children of one directory.
//!
//! The native primitive only says "something happened here". Every such
//! notification bumps a pending counter; a background pass re-lists the
//! directory and diffs the listing against the previous snapshot:
//! - names in both, still on the same inode, are unchanged,
//! - new names go through the stability tracker and are announced with
//!   `Create` once settled,
//! - names that disappeared are announced with `Delete` right away, but only
//!   if their `Create` was emitted,
//! - a name now on another inode was replaced: `Delete` for the old
//!   resource, then a stability check for the new one.
//!
//! A pass subtracts the counter value it observed before listing, so
//! notifications arriving mid-pass trigger exactly one more pass.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::stability::{Stability, StabilityTracker};
use super::types::{EventSink, WatchError, WatchEvent};

#[derive(Debug, Default)]
struct DirState {
    /// Names seen by the last listing, with their inode.
    snapshot: Listing,
    /// Names a `Create` was emitted for.
    announced: HashSet<OsString>,
    /// Names with a stability check in flight, by generation.
    checking: HashMap<OsString, u64>,
    next_generation: u64,
}

struct Shared {
    path: PathBuf,
    tracker: StabilityTracker,
    sink: EventSink,
    cancel: CancellationToken,
    state: Mutex<DirState>,
    pending: AtomicUsize,
    wake: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, DirState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: WatchEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        trace!(event = ?event, "Directory event");
        let _ = self.sink.send(event);
    }

    fn emit_error(&self, error: &dyn std::fmt::Display) {
        self.emit(WatchEvent::Error {
            path: self.path.clone(),
            message: error.to_string(),
        });
    }

    /// Called from the native watcher thread.
    fn signal(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.wake.notify_one();
    }

    async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.wake.notified() => {}
            }

            loop {
                let observed = self.pending.load(Ordering::SeqCst);
                if observed == 0 {
                    break;
                }

                self.interpret().await;
                if self.cancel.is_cancelled() {
                    return;
                }

                let remaining = self.pending.fetch_sub(observed, Ordering::SeqCst) - observed;
                if remaining == 0 {
                    break;
                }
            }
        }
    }

    /// One interpretation pass.
    async fn interpret(self: &Arc<Self>) {
        let listing = match list_children(&self.path).await {
            Ok(names) => names,
            // Best effort: the directory is unreadable for now, or it is
            // being removed and the parent reports the deletion.
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::PermissionDenied | io::ErrorKind::NotFound
                ) =>
            {
                debug!(path = %self.path.display(), error = %e, "Skipping listing");
                return;
            }
            Err(e) => {
                self.emit_error(&e);
                return;
            }
        };

        let mut recheck = Vec::new();
        {
            let mut state = self.state();
            let mut previous = std::mem::take(&mut state.snapshot);

            for (name, inode) in &listing {
                let known = previous.remove(name);
                if matches!(known, Some(old) if old != *inode) {
                    state.checking.remove(name);
                    if state.announced.remove(name) {
                        self.emit(WatchEvent::Delete(self.path.join(name)));
                    }
                    recheck.push(name.clone());
                    continue;
                }
                let settled = state.announced.contains(name) || state.checking.contains_key(name);
                if known.is_none() || !settled {
                    recheck.push(name.clone());
                }
            }

            // Whatever is left in `previous` is gone.
            for name in previous.into_keys() {
                state.checking.remove(&name);
                if state.announced.remove(&name) {
                    self.emit(WatchEvent::Delete(self.path.join(&name)));
                }
            }

            state.snapshot = listing;
        }

        for name in recheck {
            self.check_stability(name);
        }
    }

    /// Starts a stability check; the newest check of a name wins.
    fn check_stability(self: &Arc<Self>, name: OsString) {
        let generation = {
            let mut state = self.state();
            if state.announced.contains(&name) {
                return;
            }
            state.next_generation += 1;
            let generation = state.next_generation;
            state.checking.insert(name.clone(), generation);
            generation
        };

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let path = shared.path.join(&name);
            let result = tokio::select! {
                _ = shared.cancel.cancelled() => return,
                result = shared.tracker.wait_until_stable(&path, None) => result,
            };

            let mut state = shared.state();
            if shared.cancel.is_cancelled() || state.checking.get(&name) != Some(&generation) {
                return;
            }
            state.checking.remove(&name);

            match result {
                Ok(Stability::Stable(_)) => {
                    state.announced.insert(name);
                    shared.emit(WatchEvent::Create(path));
                }
                // The name may have been recreated since; the next pass
                // rechecks it if so.
                Ok(Stability::Vanished) => shared.signal(),
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {}
                Err(e) => shared.emit(WatchEvent::Error {
                    path,
                    message: e.to_string(),
                }),
            }
        });
    }
}

/// Kinds that never change the set of children.
fn is_ambiguous(kind: &EventKind) -> bool {
    !matches!(
        kind,
        EventKind::Access(_) | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Metadata(_))
    )
}

/// Child names and their inode. The inode is 0 where the platform has none.
type Listing = HashMap<OsString, u64>;

async fn list_children(path: &Path) -> io::Result<Listing> {
    let mut entries = tokio::fs::read_dir(path).await?;
    let mut children = HashMap::new();
    while let Some(entry) = entries.next_entry().await? {
        children.insert(entry.file_name(), inode(&entry));
    }
    Ok(children)
}

#[cfg(unix)]
fn inode(entry: &tokio::fs::DirEntry) -> u64 {
    entry.ino()
}

#[cfg(not(unix))]
fn inode(_entry: &tokio::fs::DirEntry) -> u64 {
    0
}

/// Emits `Create`/`Delete` for the direct children of one directory.
pub struct DirectoryWatcher {
    shared: Arc<Shared>,
    native: Mutex<Option<RecommendedWatcher>>,
}

impl DirectoryWatcher {
    /// Start watching `path`.
    ///
    /// Children present now are announced too, once stable. Consumers must
    /// tolerate a `Create` for something they already know.
    pub async fn watch(
        path: PathBuf,
        tracker: StabilityTracker,
        sink: EventSink,
    ) -> Result<Self, WatchError> {
        let shared = Arc::new(Shared {
            path: path.clone(),
            tracker,
            sink,
            cancel: CancellationToken::new(),
            state: Mutex::new(DirState::default()),
            pending: AtomicUsize::new(0),
            wake: Notify::new(),
        });

        // Install the native watch before listing so nothing that happens
        // in between is missed.
        let callback = Arc::clone(&shared);
        let mut native = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) if is_ambiguous(&event.kind) => callback.signal(),
                Ok(_) => {}
                Err(e) => callback.emit_error(&e),
            },
            notify::Config::default(),
        )?;
        native.watch(&path, RecursiveMode::NonRecursive)?;

        let children = list_children(&path)
            .await
            .map_err(|e| WatchError::io(&path, e))?;
        let names: Vec<OsString> = children.keys().cloned().collect();
        shared.state().snapshot = children;
        for name in names {
            shared.check_stability(name);
        }

        tokio::spawn(Arc::clone(&shared).run());

        debug!(path = %path.display(), "Directory watched");
        Ok(Self {
            shared,
            native: Mutex::new(Some(native)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Stop watching. Nothing is emitted afterwards.
    pub fn close(&self) {
        self.shared.cancel.cancel();
        let native = self
            .native
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(native);
    }

    /// Close, returning the children a `Create` was emitted for and no
    /// `Delete` followed.
    pub fn close_announced(&self) -> Vec<PathBuf> {
        // Emissions happen under the state lock and check the token, so
        // cancelling under the lock makes the announced set final.
        let announced = {
            let mut state = self.shared.state();
            self.shared.cancel.cancel();
            std::mem::take(&mut state.announced)
        };
        self.close();

        let mut paths: Vec<PathBuf> = announced
            .into_iter()
            .map(|name| self.shared.path.join(name))
            .collect();
        paths.sort();
        paths
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl std::fmt::Debug for DirectoryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryWatcher")
            .field("path", &self.shared.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, MetadataKind, RemoveKind, RenameMode};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    const QUIET: Duration = Duration::from_millis(50);

    async fn next(rx: &mut mpsc::UnboundedReceiver<WatchEvent>) -> WatchEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<WatchEvent>) {
        let result = tokio::time::timeout(QUIET * 6, rx.recv()).await;
        assert!(result.is_err(), "unexpected event: {:?}", result);
    }

    #[test]
    fn test_kind_classification() {
        assert!(!is_ambiguous(&EventKind::Access(AccessKind::Any)));
        assert!(!is_ambiguous(&EventKind::Modify(ModifyKind::Data(
            DataChange::Content
        ))));
        assert!(!is_ambiguous(&EventKind::Modify(ModifyKind::Metadata(
            MetadataKind::Any
        ))));
        assert!(is_ambiguous(&EventKind::Create(CreateKind::File)));
        assert!(is_ambiguous(&EventKind::Remove(RemoveKind::Any)));
        assert!(is_ambiguous(&EventKind::Modify(ModifyKind::Name(
            RenameMode::Any
        ))));
        assert!(is_ambiguous(&EventKind::Any));
    }

    #[tokio::test]
    async fn test_existing_children_announced() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.zip"), b"a").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _watcher =
            DirectoryWatcher::watch(dir.path().to_path_buf(), StabilityTracker::new(QUIET), tx)
                .await
                .unwrap();

        assert_eq!(next(&mut rx).await, WatchEvent::Create(dir.path().join("a.zip")));
    }

    #[tokio::test]
    async fn test_new_empty_file_created_once() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher =
            DirectoryWatcher::watch(dir.path().to_path_buf(), StabilityTracker::new(QUIET), tx)
                .await
                .unwrap();

        std::fs::File::create(dir.path().join("empty.zip")).unwrap();

        assert_eq!(
            next(&mut rx).await,
            WatchEvent::Create(dir.path().join("empty.zip"))
        );
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_delete_after_create() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.zip");
        std::fs::write(&path, b"a").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher =
            DirectoryWatcher::watch(dir.path().to_path_buf(), StabilityTracker::new(QUIET), tx)
                .await
                .unwrap();

        assert_eq!(next(&mut rx).await, WatchEvent::Create(path.clone()));
        std::fs::remove_file(&path).unwrap();
        assert_eq!(next(&mut rx).await, WatchEvent::Delete(path));
    }

    #[tokio::test]
    async fn test_transient_file_never_announced() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = DirectoryWatcher::watch(
            dir.path().to_path_buf(),
            StabilityTracker::new(Duration::from_millis(200)),
            tx,
        )
        .await
        .unwrap();

        let path = dir.path().join("tmp.part");
        std::fs::write(&path, b"x").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        std::fs::remove_file(&path).unwrap();

        let result = tokio::time::timeout(Duration::from_millis(600), rx.recv()).await;
        assert!(result.is_err(), "unexpected event: {:?}", result);
    }

    #[tokio::test]
    async fn test_rename_is_delete_plus_create() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("old.zip");
        let new = dir.path().join("new.zip");
        std::fs::write(&old, b"a").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher =
            DirectoryWatcher::watch(dir.path().to_path_buf(), StabilityTracker::new(QUIET), tx)
                .await
                .unwrap();
        assert_eq!(next(&mut rx).await, WatchEvent::Create(old.clone()));

        std::fs::rename(&old, &new).unwrap();

        // The delete is immediate, the create waits for stability.
        assert_eq!(next(&mut rx).await, WatchEvent::Delete(old));
        assert_eq!(next(&mut rx).await, WatchEvent::Create(new));
    }

    #[tokio::test]
    async fn test_replaced_under_same_name_is_delete_plus_create() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.zip");
        let staged = dir.path().join(".a.zip.part");
        std::fs::write(&path, b"first").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher =
            DirectoryWatcher::watch(dir.path().to_path_buf(), StabilityTracker::new(QUIET), tx)
                .await
                .unwrap();
        assert_eq!(next(&mut rx).await, WatchEvent::Create(path.clone()));

        // Atomic replace: the staged file takes over the name.
        std::fs::write(&staged, b"second").unwrap();
        std::fs::rename(&staged, &path).unwrap();

        let mut events = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(QUIET * 6, rx.recv()).await {
            events.push(event);
        }
        let for_path: Vec<_> = events.iter().filter(|e| e.path() == path).collect();
        assert_eq!(
            for_path,
            vec![&WatchEvent::Delete(path.clone()), &WatchEvent::Create(path.clone())]
        );
    }

    #[tokio::test]
    async fn test_close_suppresses_events() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher =
            DirectoryWatcher::watch(dir.path().to_path_buf(), StabilityTracker::new(QUIET), tx)
                .await
                .unwrap();

        std::fs::write(dir.path().join("a.zip"), b"a").unwrap();
        watcher.close();
        assert!(watcher.is_closed());

        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_close_announced_returns_undeleted_children() {
        let dir = TempDir::new().unwrap();
        let kept = dir.path().join("kept.zip");
        let gone = dir.path().join("gone.zip");
        std::fs::write(&kept, b"a").unwrap();
        std::fs::write(&gone, b"b").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher =
            DirectoryWatcher::watch(dir.path().to_path_buf(), StabilityTracker::new(QUIET), tx)
                .await
                .unwrap();
        next(&mut rx).await;
        next(&mut rx).await;

        std::fs::remove_file(&gone).unwrap();
        assert_eq!(next(&mut rx).await, WatchEvent::Delete(gone));

        assert_eq!(watcher.close_announced(), vec![kept]);
        assert!(watcher.is_closed());
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_watch_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = DirectoryWatcher::watch(
            dir.path().join("missing"),
            StabilityTracker::new(QUIET),
            tx,
        )
        .await;
        assert!(result.is_err());
    }
}
