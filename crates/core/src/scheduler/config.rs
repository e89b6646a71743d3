//! Scheduler configuration.

use serde::{Deserialize, Serialize};

use crate::package::PackageType;

/// Configuration for the publish scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of packages processed at the same time.
    /// Further submissions wait in a FIFO queue.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Accepted package types (lowercase file extensions, `tar.gz` allowed).
    #[serde(default = "default_accepted_types")]
    pub accepted_types: Vec<String>,
}

fn default_max_concurrent() -> usize {
    3
}

fn default_accepted_types() -> Vec<String> {
    ["zip", "tar", "tgz", "tar.gz", "mp4"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl SchedulerConfig {
    /// Returns true if packages of this type may be submitted.
    pub fn accepts(&self, package_type: &PackageType) -> bool {
        self.accepted_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(package_type.as_str()))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            accepted_types: default_accepted_types(),
        }
    }
}
