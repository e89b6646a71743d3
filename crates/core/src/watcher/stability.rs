//! Waits for files to stop changing.

use std::fs::Metadata;
use std::io;
use std::path::Path;
use std::time::Duration;

/// Result of a stability wait.
#[derive(Debug)]
pub enum Stability {
    /// Two consecutive observations matched. Carries the last one.
    Stable(Metadata),
    /// The resource disappeared before it settled.
    Vanished,
}

/// Re-stats a resource every quiet period until its size and modification
/// time are unchanged between two observations.
///
/// Directories are stable as soon as they are seen.
#[derive(Debug, Clone)]
pub struct StabilityTracker {
    quiet_period: Duration,
}

impl StabilityTracker {
    pub fn new(quiet_period: Duration) -> Self {
        Self { quiet_period }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    /// Wait until `path` is stable.
    ///
    /// `previous` seeds the comparison; without it the first observation is
    /// taken immediately. Not-found is reported as [`Stability::Vanished`],
    /// other I/O errors are returned.
    pub async fn wait_until_stable(
        &self,
        path: &Path,
        previous: Option<Metadata>,
    ) -> io::Result<Stability> {
        let mut previous = match previous {
            Some(metadata) => metadata,
            None => match stat(path).await? {
                Some(metadata) => metadata,
                None => return Ok(Stability::Vanished),
            },
        };

        if previous.is_dir() {
            return Ok(Stability::Stable(previous));
        }

        loop {
            tokio::time::sleep(self.quiet_period).await;

            let Some(current) = stat(path).await? else {
                return Ok(Stability::Vanished);
            };

            if current.is_dir() || unchanged(&previous, &current) {
                return Ok(Stability::Stable(current));
            }
            previous = current;
        }
    }
}

async fn stat(path: &Path) -> io::Result<Option<Metadata>> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(Some(metadata)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn unchanged(before: &Metadata, after: &Metadata) -> bool {
    before.len() == after.len() && before.modified().ok() == after.modified().ok()
}
