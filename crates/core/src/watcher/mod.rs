//! Hot-folder watching.
//!
//! Turns native directory notifications into settled `Create`/`Delete`
//! events across whole directory trees:
//!
//! - [`StabilityTracker`] waits until a file stops changing
//! - [`DirectoryWatcher`] diffs the children of one directory
//! - [`RecursiveWatcher`] keeps one directory watcher per directory of a tree
//! - [`WatchRegistry`] manages the configured roots

mod directory;
mod recursive;
mod registry;
mod stability;
mod types;

pub use directory::DirectoryWatcher;
pub use recursive::RecursiveWatcher;
pub use registry::{WatchOutcome, WatchRegistry};
pub use stability::{Stability, StabilityTracker};
pub use types::{EventSink, WatchError, WatchEvent, WatcherConfig};
