//! The publishing steps, one per transition.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::machine::{Step, StepError, StepOutcome};
use crate::package::{ErrorCode, PackageDescriptor, PackageState};
use crate::platform::{MediaFields, Platform};

use super::archive;
use super::PipelineContext;

/// Directory the archive is unpacked into, under the package work dir.
pub const EXTRACTED_DIR: &str = "extracted";

impl PipelineContext {
    /// `<work_dir>/<package id>`
    pub fn package_dir(&self, package: &PackageDescriptor) -> PathBuf {
        self.config.work_dir.join(&package.id)
    }

    /// The copy of the source inside the package work dir.
    pub fn archive_path(&self, package: &PackageDescriptor) -> PathBuf {
        self.package_dir(package).join(package.file_name())
    }

    pub fn extracted_dir(&self, package: &PackageDescriptor) -> PathBuf {
        self.package_dir(package).join(EXTRACTED_DIR)
    }

    /// Platform the package goes to: its own hint, else the default.
    pub fn platform_name(&self, package: &PackageDescriptor) -> Option<String> {
        package
            .platform
            .clone()
            .or_else(|| self.config.default_platform.clone())
    }

    fn platform(&self, package: &PackageDescriptor) -> Result<Arc<dyn Platform>, StepError> {
        let name = self.platform_name(package).ok_or_else(|| {
            StepError::new(ErrorCode::UnknownPlatform, "no platform selected")
        })?;
        self.platforms.get(&name).ok_or_else(|| {
            StepError::new(
                ErrorCode::UnknownPlatform,
                format!("platform '{}' is not configured", name),
            )
        })
    }
}

fn is_not_found(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}

async fn blocking<T, F>(code: ErrorCode, f: F) -> Result<T, StepError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StepError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StepError::new(code, format!("worker task failed: {}", e)))?
}

// ============================================================================
// copy
// ============================================================================

/// Copies the source into the package work dir and optionally removes it
/// from the hot folder.
pub struct CopyStep {
    ctx: Arc<PipelineContext>,
}

impl CopyStep {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Step for CopyStep {
    async fn execute(&self, package: &mut PackageDescriptor) -> Result<StepOutcome, StepError> {
        let work = self.ctx.package_dir(package);
        tokio::fs::create_dir_all(&work).await.map_err(|e| {
            StepError::new(
                ErrorCode::CopyFailed,
                format!("cannot create {}: {}", work.display(), e),
            )
        })?;

        let target = self.ctx.archive_path(package);
        let copy_failed = |e: io::Error| {
            StepError::new(
                ErrorCode::CopyFailed,
                format!("cannot copy {}: {}", package.source_path.display(), e),
            )
        };
        match tokio::fs::copy(&package.source_path, &target).await {
            Ok(bytes) => debug!(package_id = %package.id, bytes, "Copied package"),
            Err(e) if is_not_found(&e) => {
                // A previous run copied and removed the source before crashing.
                if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
                    return Err(copy_failed(e));
                }
            }
            Err(e) => return Err(copy_failed(e)),
        }

        if self.ctx.config.remove_original {
            match tokio::fs::remove_file(&package.source_path).await {
                Ok(()) => {}
                Err(e) if is_not_found(&e) => {}
                Err(e) => warn!(
                    package_id = %package.id,
                    path = %package.source_path.display(),
                    error = %e,
                    "Failed to remove original"
                ),
            }
        }

        Ok(StepOutcome::Advance)
    }
}

// ============================================================================
// validate
// ============================================================================

/// Checks the copied archive opens and is safe to unpack.
pub struct ValidateStep {
    ctx: Arc<PipelineContext>,
}

impl ValidateStep {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Step for ValidateStep {
    async fn execute(&self, package: &mut PackageDescriptor) -> Result<StepOutcome, StepError> {
        let path = self.ctx.archive_path(package);

        match package.package_type.archive_kind() {
            Some(kind) => {
                let entries = blocking(ErrorCode::InvalidArchive, move || {
                    archive::inspect(&path, kind)
                        .map_err(|e| StepError::new(ErrorCode::InvalidArchive, e.to_string()))
                })
                .await?;
                if entries == 0 {
                    return Err(StepError::new(ErrorCode::InvalidArchive, "archive is empty"));
                }
            }
            None => {
                let metadata = tokio::fs::metadata(&path)
                    .await
                    .map_err(|e| StepError::new(ErrorCode::InvalidArchive, e.to_string()))?;
                if metadata.len() == 0 {
                    return Err(StepError::new(ErrorCode::InvalidArchive, "media file is empty"));
                }
            }
        }

        Ok(StepOutcome::Advance)
    }
}

// ============================================================================
// extract
// ============================================================================

/// Unpacks the package and lets a format strategy describe it.
pub struct ExtractStep {
    ctx: Arc<PipelineContext>,
}

impl ExtractStep {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    async fn unpack(&self, package: &PackageDescriptor) -> Result<(), StepError> {
        let source = self.ctx.archive_path(package);
        let target = self.ctx.extracted_dir(package);
        let failed = |e: io::Error| StepError::new(ErrorCode::ExtractionFailed, e.to_string());

        match package.package_type.archive_kind() {
            Some(kind) => {
                // Start from scratch so a re-run never mixes two extractions.
                match tokio::fs::remove_dir_all(&target).await {
                    Ok(()) => {}
                    Err(e) if is_not_found(&e) => {}
                    Err(e) => return Err(failed(e)),
                }
                tokio::fs::create_dir_all(&target).await.map_err(failed)?;

                blocking(ErrorCode::ExtractionFailed, move || {
                    archive::extract(&source, kind, &target)
                        .map_err(|e| StepError::new(ErrorCode::ExtractionFailed, e.to_string()))
                })
                .await
            }
            None => {
                let moved = target.join(package.file_name());
                if tokio::fs::try_exists(&source).await.unwrap_or(false) {
                    tokio::fs::create_dir_all(&target).await.map_err(failed)?;
                    tokio::fs::rename(&source, &moved).await.map_err(failed)?;
                    Ok(())
                } else if tokio::fs::try_exists(&moved).await.unwrap_or(false) {
                    Ok(())
                } else {
                    Err(StepError::new(
                        ErrorCode::ExtractionFailed,
                        format!("{} is missing", source.display()),
                    ))
                }
            }
        }
    }
}

#[async_trait]
impl Step for ExtractStep {
    async fn execute(&self, package: &mut PackageDescriptor) -> Result<StepOutcome, StepError> {
        self.unpack(package).await?;

        let dir = self.ctx.extracted_dir(package);
        let formats = self.ctx.formats.clone();
        let (format, medias, points) = blocking(ErrorCode::ValidationFailed, move || {
            let invalid = |message: String| StepError::new(ErrorCode::ValidationFailed, message);

            let format = formats
                .select(&dir)
                .ok_or_else(|| invalid("no format recognises the package".to_string()))?;
            format.validate(&dir).map_err(|e| invalid(e.to_string()))?;
            let medias = format.medias(&dir).map_err(|e| invalid(e.to_string()))?;
            let points = format
                .points_of_interest(&dir)
                .map_err(|e| invalid(e.to_string()))?;
            if medias.is_empty() {
                return Err(invalid(format!("format {} found no media", format.name())));
            }
            Ok((format.name().to_string(), medias, points))
        })
        .await?;

        debug!(
            package_id = %package.id,
            format = %format,
            medias = medias.len(),
            points = points.len(),
            "Package extracted"
        );

        package.metadata.format = Some(format);
        package.metadata.medias = medias;
        package.metadata.points_of_interest = points;
        Ok(StepOutcome::Advance)
    }
}

// ============================================================================
// upload
// ============================================================================

/// Uploads every media, or parks the package when no platform is chosen.
pub struct UploadStep {
    ctx: Arc<PipelineContext>,
}

impl UploadStep {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Step for UploadStep {
    async fn execute(&self, package: &mut PackageDescriptor) -> Result<StepOutcome, StepError> {
        let Some(name) = self.ctx.platform_name(package) else {
            return Ok(StepOutcome::Park(PackageState::WaitingForUpload));
        };
        let platform = self.ctx.platform(package)?;
        package.platform = Some(name);

        let dir = self.ctx.extracted_dir(package);
        // Medias uploaded by an earlier, interrupted attempt keep their ids.
        let done = package.media_ids.len().min(package.metadata.medias.len());
        let remaining: Vec<String> = package.metadata.medias[done..].to_vec();

        for media in remaining {
            let path = dir.join(&media);
            let media_id = platform.upload(&path).await.map_err(|e| {
                StepError::new(
                    ErrorCode::UploadFailed,
                    format!("upload of {} to {} failed: {}", media, platform.name(), e),
                )
            })?;
            debug!(package_id = %package.id, media = %media, media_id = %media_id, "Media uploaded");
            package.media_ids.push(media_id);
        }

        Ok(StepOutcome::Advance)
    }
}

// ============================================================================
// await_ready
// ============================================================================

/// Polls the platform until every uploaded media is available.
pub struct AwaitReadyStep {
    ctx: Arc<PipelineContext>,
}

impl AwaitReadyStep {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Step for AwaitReadyStep {
    async fn execute(&self, package: &mut PackageDescriptor) -> Result<StepOutcome, StepError> {
        let platform = self.ctx.platform(package)?;
        let interval = Duration::from_millis(self.ctx.config.readiness_poll_interval_ms);

        match platform
            .status(&package.media_ids, self.ctx.config.expected_quality.as_deref())
            .await
        {
            Ok(status) if status.available => {
                package.metadata.sources = status.sources;
                Ok(StepOutcome::Advance)
            }
            Ok(_) => Ok(StepOutcome::Reschedule(interval)),
            // Readiness polls are retried; the reschedule budget bounds them.
            Err(e) => {
                warn!(
                    package_id = %package.id,
                    platform = %platform.name(),
                    error = %e,
                    "Readiness check failed"
                );
                Ok(StepOutcome::Reschedule(interval))
            }
        }
    }
}

// ============================================================================
// synchronize_metadata
// ============================================================================

/// Pushes the title and points of interest to every uploaded media.
pub struct SynchronizeMetadataStep {
    ctx: Arc<PipelineContext>,
}

impl SynchronizeMetadataStep {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Step for SynchronizeMetadataStep {
    async fn execute(&self, package: &mut PackageDescriptor) -> Result<StepOutcome, StepError> {
        let platform = self.ctx.platform(package)?;
        let fields = MediaFields {
            title: Some(package.metadata.title.clone()),
            points_of_interest: Some(package.metadata.points_of_interest.clone()),
        };

        for media_id in &package.media_ids {
            platform.update(media_id, &fields).await.map_err(|e| {
                StepError::new(
                    ErrorCode::MetadataSyncFailed,
                    format!("update of {} failed: {}", media_id, e),
                )
            })?;
        }

        Ok(StepOutcome::Advance)
    }
}

// ============================================================================
// publish
// ============================================================================

/// Removes the package work dir. The medias stay on the platform.
pub struct PublishStep {
    ctx: Arc<PipelineContext>,
}

impl PublishStep {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Step for PublishStep {
    async fn execute(&self, package: &mut PackageDescriptor) -> Result<StepOutcome, StepError> {
        remove_work_dir(&self.ctx.package_dir(package))
            .await
            .map_err(|e| StepError::new(ErrorCode::PublishFailed, e.to_string()))?;
        Ok(StepOutcome::Advance)
    }
}

async fn remove_work_dir(dir: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e),
    }
}
