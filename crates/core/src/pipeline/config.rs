//! Pipeline configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the publishing pipeline steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Packages are copied to `<work_dir>/<package id>/` and processed there.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Delete the file from the hot folder once it has been copied.
    #[serde(default = "default_true")]
    pub remove_original: bool,

    /// Platform used when neither the package nor its hot folder names one.
    /// When unset such packages wait for an explicit upload request.
    #[serde(default)]
    pub default_platform: Option<String>,

    /// Delay between two readiness checks of uploaded medias (milliseconds).
    #[serde(default = "default_readiness_interval")]
    pub readiness_poll_interval_ms: u64,

    /// Quality the platform must report before a media counts as ready.
    #[serde(default)]
    pub expected_quality: Option<String>,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("work")
}

fn default_true() -> bool {
    true
}

fn default_readiness_interval() -> u64 {
    10_000 // 10 seconds
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            remove_original: true,
            default_platform: None,
            readiness_poll_interval_ms: default_readiness_interval(),
            expected_quality: None,
        }
    }
}
