//! Watch events, errors and configuration.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// A synthesized filesystem event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A resource appeared and stopped changing.
    Create(PathBuf),
    /// A previously announced resource disappeared.
    Delete(PathBuf),
    /// A directory is now watched as part of its tree.
    Watch(PathBuf),
    /// Watching `path` failed; it may miss events from now on.
    Error { path: PathBuf, message: String },
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Create(path)
            | WatchEvent::Delete(path)
            | WatchEvent::Watch(path)
            | WatchEvent::Error { path, .. } => path,
        }
    }

    /// Metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            WatchEvent::Create(_) => "create",
            WatchEvent::Delete(_) => "delete",
            WatchEvent::Watch(_) => "watch",
            WatchEvent::Error { .. } => "error",
        }
    }
}

/// Channel the watchers publish into.
pub type EventSink = mpsc::UnboundedSender<WatchEvent>;

/// Errors returned when a directory cannot be watched.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("{0} is already watched")]
    AlreadyWatched(PathBuf),

    #[error("{path} contains watched root {root}")]
    ContainsWatched { path: PathBuf, root: PathBuf },

    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("native watcher error: {0}")]
    Notify(#[from] notify::Error),
}

impl WatchError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        WatchError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Configuration for directory watching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// How long a file's size and modification time must stay unchanged
    /// before it is announced (milliseconds).
    #[serde(default = "default_quiet_period")]
    pub stability_quiet_period_ms: u64,
}

fn default_quiet_period() -> u64 {
    10_000 // 10 seconds
}

impl WatcherConfig {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.stability_quiet_period_ms)
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            stability_quiet_period_ms: default_quiet_period(),
        }
    }
}
