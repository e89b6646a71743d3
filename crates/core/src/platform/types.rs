//! Types for media platform operations.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::package::PointOfInterest;

/// Errors that can occur during platform operations.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Media not found: {0}")]
    MediaNotFound(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Request timeout")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// One playable rendition of a media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSource {
    pub media_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Availability of a set of medias.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStatus {
    /// True once every requested media is available in the expected quality.
    pub available: bool,
    #[serde(default)]
    pub sources: Vec<MediaSource>,
}

/// Fields pushed to the platform when synchronizing metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points_of_interest: Option<Vec<PointOfInterest>>,
}

/// Upload capability of a remote video platform.
///
/// Calls may be slow and may fail; the pipeline treats every error as a
/// transition failure.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Platform name for logging.
    fn name(&self) -> &str;

    /// Upload a media file, returning the platform's media id.
    async fn upload(&self, file: &Path) -> Result<String, PlatformError>;

    /// Report whether the medias are available, optionally in a given quality.
    async fn status(
        &self,
        media_ids: &[String],
        expected_quality: Option<&str>,
    ) -> Result<MediaStatus, PlatformError>;

    /// Remove medias from the platform.
    async fn remove(&self, media_ids: &[String]) -> Result<(), PlatformError>;

    /// Update the fields of one media.
    async fn update(&self, media_id: &str, fields: &MediaFields) -> Result<(), PlatformError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_fields_skip_unset() {
        let fields = MediaFields {
            title: Some("Lecture 1".to_string()),
            points_of_interest: None,
        };
        let json = serde_json::to_string(&fields).unwrap();
        assert_eq!(json, r#"{"title":"Lecture 1"}"#);
    }

    #[test]
    fn test_media_status_deserialize_without_sources() {
        let status: MediaStatus = serde_json::from_str(r#"{"available":false}"#).unwrap();
        assert!(!status.available);
        assert!(status.sources.is_empty());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(PlatformError::Timeout.to_string(), "Request timeout");
        assert_eq!(
            PlatformError::MediaNotFound("m1".to_string()).to_string(),
            "Media not found: m1"
        );
    }
}
