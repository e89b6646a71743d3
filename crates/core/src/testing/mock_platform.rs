//! Mock media platform for testing.

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::platform::{MediaFields, MediaSource, MediaStatus, Platform, PlatformError};

/// A recorded upload for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedUpload {
    /// File that was uploaded.
    pub path: PathBuf,
    /// Media id handed back.
    pub media_id: String,
    /// Uploaded content, so assertions survive work directory cleanup.
    pub content: Vec<u8>,
    /// When the upload happened.
    pub timestamp: chrono::DateTime<Utc>,
}

/// A recorded metadata update for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedUpdate {
    pub media_id: String,
    pub fields: MediaFields,
}

/// Mock implementation of the Platform trait.
///
/// Provides controllable behavior for testing:
/// - Track uploads, updates and removals for assertions
/// - Report medias unavailable for a number of status polls
/// - Simulate failures and slow uploads
///
/// # Example
///
/// ```rust,ignore
/// let platform = MockPlatform::new("vod");
/// platform.set_ready_after(2).await; // two "not ready" answers first
///
/// let id = platform.upload(Path::new("/work/a.mp4")).await?;
/// assert!(!platform.status(&[id.clone()], None).await?.available);
///
/// let uploads = platform.recorded_uploads().await;
/// assert_eq!(uploads.len(), 1);
/// ```
#[derive(Debug)]
pub struct MockPlatform {
    name: String,
    uploads: Arc<RwLock<Vec<RecordedUpload>>>,
    updates: Arc<RwLock<Vec<RecordedUpdate>>>,
    removed: Arc<RwLock<Vec<String>>>,
    /// If set, the next operation will fail with this error.
    next_error: Arc<RwLock<Option<PlatformError>>>,
    /// Status polls left that answer "not available".
    pending_polls: Arc<RwLock<u32>>,
    status_calls: AtomicUsize,
    /// Simulated upload duration.
    upload_delay: Arc<RwLock<Duration>>,
    active_uploads: AtomicUsize,
    peak_uploads: AtomicUsize,
    id_counter: AtomicUsize,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new("mock")
    }
}

impl MockPlatform {
    /// Create a new mock platform.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uploads: Arc::new(RwLock::new(Vec::new())),
            updates: Arc::new(RwLock::new(Vec::new())),
            removed: Arc::new(RwLock::new(Vec::new())),
            next_error: Arc::new(RwLock::new(None)),
            pending_polls: Arc::new(RwLock::new(0)),
            status_calls: AtomicUsize::new(0),
            upload_delay: Arc::new(RwLock::new(Duration::ZERO)),
            active_uploads: AtomicUsize::new(0),
            peak_uploads: AtomicUsize::new(0),
            id_counter: AtomicUsize::new(0),
        }
    }

    /// Get all recorded uploads.
    pub async fn recorded_uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.read().await.clone()
    }

    /// Get all recorded metadata updates.
    pub async fn recorded_updates(&self) -> Vec<RecordedUpdate> {
        self.updates.read().await.clone()
    }

    /// Get all removed media ids.
    pub async fn removed_medias(&self) -> Vec<String> {
        self.removed.read().await.clone()
    }

    /// Configure the next operation to fail with the given error.
    pub async fn set_next_error(&self, error: PlatformError) {
        *self.next_error.write().await = Some(error);
    }

    /// Clear any pending error.
    pub async fn clear_next_error(&self) {
        *self.next_error.write().await = None;
    }

    /// Answer "not available" to the next `polls` status calls.
    pub async fn set_ready_after(&self, polls: u32) {
        *self.pending_polls.write().await = polls;
    }

    /// Make every upload take this long.
    pub async fn set_upload_delay(&self, delay: Duration) {
        *self.upload_delay.write().await = delay;
    }

    /// Number of status calls so far.
    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    /// Highest number of uploads observed running at the same time.
    pub fn peak_concurrent_uploads(&self) -> usize {
        self.peak_uploads.load(Ordering::SeqCst)
    }

    /// Take the next error if set.
    async fn take_error(&self) -> Option<PlatformError> {
        self.next_error.write().await.take()
    }
}

#[async_trait]
impl Platform for MockPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upload(&self, file: &Path) -> Result<String, PlatformError> {
        if let Some(err) = self.take_error().await {
            return Err(err);
        }

        let content = tokio::fs::read(file).await?;

        let active = self.active_uploads.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_uploads.fetch_max(active, Ordering::SeqCst);

        let delay = *self.upload_delay.read().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.active_uploads.fetch_sub(1, Ordering::SeqCst);

        let media_id = format!(
            "media-{}",
            self.id_counter.fetch_add(1, Ordering::SeqCst) + 1
        );
        self.uploads.write().await.push(RecordedUpload {
            path: file.to_path_buf(),
            media_id: media_id.clone(),
            content,
            timestamp: Utc::now(),
        });

        Ok(media_id)
    }

    async fn status(
        &self,
        media_ids: &[String],
        expected_quality: Option<&str>,
    ) -> Result<MediaStatus, PlatformError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(err) = self.take_error().await {
            return Err(err);
        }

        let mut pending = self.pending_polls.write().await;
        if *pending > 0 {
            *pending -= 1;
            return Ok(MediaStatus::default());
        }

        Ok(MediaStatus {
            available: true,
            sources: media_ids
                .iter()
                .map(|id| MediaSource {
                    media_id: id.clone(),
                    quality: expected_quality.map(String::from),
                    url: Some(format!("https://mock.invalid/{}", id)),
                })
                .collect(),
        })
    }

    async fn remove(&self, media_ids: &[String]) -> Result<(), PlatformError> {
        if let Some(err) = self.take_error().await {
            return Err(err);
        }
        self.removed.write().await.extend(media_ids.iter().cloned());
        Ok(())
    }

    async fn update(&self, media_id: &str, fields: &MediaFields) -> Result<(), PlatformError> {
        if let Some(err) = self.take_error().await {
            return Err(err);
        }
        self.updates.write().await.push(RecordedUpdate {
            media_id: media_id.to_string(),
            fields: fields.clone(),
        });
        Ok(())
    }
}
