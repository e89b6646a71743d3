//! Types for the publish scheduler.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::package::{ErrorCode, PackageDescriptor, PackageError, PackageState};

/// Errors returned synchronously by scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Unaccepted or missing package type. Nothing was persisted.
    #[error("invalid package {path}: {reason}")]
    InvalidPackage { path: PathBuf, reason: String },

    /// The source is tracked by an unfinished package, or was published
    /// unchanged.
    #[error("{path} is already tracked by package {package_id}")]
    Duplicate { path: PathBuf, package_id: String },

    /// Package not found.
    #[error("package not found: {0}")]
    NotFound(String),

    /// Operation not allowed in the package's current state.
    #[error("cannot {operation} package {package_id} in state {state}")]
    InvalidState {
        package_id: String,
        state: PackageState,
        operation: &'static str,
    },

    /// Platform name not configured.
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),

    /// The platform refused a request made on behalf of a package.
    #[error("platform {platform} failed for package {package_id}: {message}")]
    Platform {
        package_id: String,
        platform: String,
        message: String,
    },

    /// Package store error.
    #[error("package store error: {0}")]
    Store(#[from] PackageError),
}

/// A request to publish a source file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub source_path: PathBuf,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

impl SubmitRequest {
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            ..Default::default()
        }
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }
}

/// Lifecycle signals broadcast by the scheduler.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// The package reached its terminal success state.
    Completed(PackageDescriptor),
    /// A transition failed; the package is in `error`.
    Failed {
        package: PackageDescriptor,
        code: ErrorCode,
        message: String,
    },
    /// The package stopped in a state that waits for an operator.
    Parked(PackageDescriptor),
    /// An operator retry (or crash recovery) re-admitted the package.
    RetryStarted(PackageDescriptor),
    /// A parked package was resumed with an explicit platform.
    UploadStarted(PackageDescriptor),
}

impl SchedulerEvent {
    pub fn package(&self) -> &PackageDescriptor {
        match self {
            SchedulerEvent::Completed(package)
            | SchedulerEvent::Failed { package, .. }
            | SchedulerEvent::Parked(package)
            | SchedulerEvent::RetryStarted(package)
            | SchedulerEvent::UploadStarted(package) => package,
        }
    }
}

/// Current admission state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub max_concurrent: usize,
    /// Packages currently running.
    pub in_flight: usize,
    /// Packages waiting for a slot.
    pub queued: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedulerError::InvalidState {
            package_id: "pkg-1".to_string(),
            state: PackageState::Published,
            operation: "retry",
        };
        assert_eq!(
            err.to_string(),
            "cannot retry package pkg-1 in state published"
        );
    }

    #[test]
    fn test_submit_request_deserialize() {
        let request: SubmitRequest =
            serde_json::from_str(r#"{"source_path": "/hot/a.zip", "platform": "vod"}"#).unwrap();
        assert_eq!(request.source_path, PathBuf::from("/hot/a.zip"));
        assert_eq!(request.platform.as_deref(), Some("vod"));
        assert!(request.owner.is_none());
    }
}
