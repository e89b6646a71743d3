//! Core package data types.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::platform::MediaSource;

// ============================================================================
// States and transitions
// ============================================================================

/// State of a package within the publishing pipeline.
///
/// Every state except `Error`, `WaitingForUpload` and `Published` is an
/// in-progress state: a package found in one of them after a restart was
/// interrupted and is resumed from its checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageState {
    /// Submitted, waiting for a scheduler slot or for its first step.
    Pending,
    /// Source archive copied into the work directory.
    Copied,
    /// Archive integrity checked.
    Validated,
    /// Archive unpacked and format strategy resolved.
    Extracted,
    /// Media files uploaded to the platform.
    Uploaded,
    /// Platform reports every media as available.
    Ready,
    /// Metadata pushed to the platform.
    Synchronized,
    /// Published (terminal, success).
    Published,
    /// A step failed. Retry-able by an operator.
    Error,
    /// No platform chosen yet. Resumable with an explicit platform.
    WaitingForUpload,
}

impl PackageState {
    /// All states, in pipeline order.
    pub const ALL: [PackageState; 10] = [
        PackageState::Pending,
        PackageState::Copied,
        PackageState::Validated,
        PackageState::Extracted,
        PackageState::Uploaded,
        PackageState::Ready,
        PackageState::Synchronized,
        PackageState::Published,
        PackageState::Error,
        PackageState::WaitingForUpload,
    ];

    /// Returns the state as its persisted tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageState::Pending => "pending",
            PackageState::Copied => "copied",
            PackageState::Validated => "validated",
            PackageState::Extracted => "extracted",
            PackageState::Uploaded => "uploaded",
            PackageState::Ready => "ready",
            PackageState::Synchronized => "synchronized",
            PackageState::Published => "published",
            PackageState::Error => "error",
            PackageState::WaitingForUpload => "waiting_for_upload",
        }
    }

    /// Parses a persisted tag.
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.as_str() == tag)
    }

    /// Returns true if no further transition will ever run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PackageState::Published)
    }

    /// Returns true if the package rests here until an operator acts
    /// (or forever, for `Published`).
    pub fn is_stable(&self) -> bool {
        matches!(
            self,
            PackageState::Published | PackageState::Error | PackageState::WaitingForUpload
        )
    }

    /// States a crashed process left packages in mid-flight.
    pub fn in_progress() -> Vec<PackageState> {
        Self::ALL.iter().copied().filter(|s| !s.is_stable()).collect()
    }
}

impl fmt::Display for PackageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named unit of work in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Copy,
    Validate,
    Extract,
    Upload,
    AwaitReady,
    SynchronizeMetadata,
    Publish,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Copy => "copy",
            Transition::Validate => "validate",
            Transition::Extract => "extract",
            Transition::Upload => "upload",
            Transition::AwaitReady => "await_ready",
            Transition::SynchronizeMetadata => "synchronize_metadata",
            Transition::Publish => "publish",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The last successfully reached state and the transition to run next.
///
/// Resuming a package always re-enters the machine here, so a failed
/// transition is re-attempted and completed ones are never repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checkpoint {
    pub state: PackageState,
    pub transition: Transition,
}

impl Checkpoint {
    pub fn new(state: PackageState, transition: Transition) -> Self {
        Self { state, transition }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.state, self.transition)
    }
}

/// Structured error codes recorded on a failed package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    CopyFailed,
    InvalidArchive,
    ExtractionFailed,
    ValidationFailed,
    UnknownPlatform,
    UploadFailed,
    MediaNotReady,
    MetadataSyncFailed,
    PublishFailed,
    InvalidCheckpoint,
    Storage,
    /// A step aborted without reporting an error.
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CopyFailed => "copy_failed",
            ErrorCode::InvalidArchive => "invalid_archive",
            ErrorCode::ExtractionFailed => "extraction_failed",
            ErrorCode::ValidationFailed => "validation_failed",
            ErrorCode::UnknownPlatform => "unknown_platform",
            ErrorCode::UploadFailed => "upload_failed",
            ErrorCode::MediaNotReady => "media_not_ready",
            ErrorCode::MetadataSyncFailed => "metadata_sync_failed",
            ErrorCode::PublishFailed => "publish_failed",
            ErrorCode::InvalidCheckpoint => "invalid_checkpoint",
            ErrorCode::Storage => "storage",
            ErrorCode::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Package type
// ============================================================================

/// Package type tag, derived from the source file extension (lowercase).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageType(String);

impl PackageType {
    /// Derives the type tag from a file name. `tar.gz` is kept whole.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_lowercase();
        if name.ends_with(".tar.gz") && name.len() > ".tar.gz".len() {
            return Some(Self("tar.gz".to_string()));
        }
        let ext = Path::new(&name).extension()?.to_str()?;
        if ext.is_empty() {
            return None;
        }
        Some(Self(ext.to_string()))
    }

    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the archive container for this type, if it is one.
    pub fn archive_kind(&self) -> Option<ArchiveKind> {
        match self.0.as_str() {
            "zip" => Some(ArchiveKind::Zip),
            "tar" => Some(ArchiveKind::Tar),
            "tgz" | "tar.gz" => Some(ArchiveKind::TarGz),
            _ => None,
        }
    }
}

impl fmt::Display for PackageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Archive containers the pipeline can unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

// ============================================================================
// Metadata
// ============================================================================

/// A timed annotation extracted from a package (chapter, tag, slide...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointOfInterest {
    #[serde(rename = "type")]
    pub kind: String,
    /// Milliseconds from the start of the media.
    pub timecode: u64,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Information gathered while processing a package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageMetadata {
    /// Human readable title (file stem of the source).
    #[serde(default)]
    pub title: String,
    /// Name of the archive format strategy that accepted the package.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Media files, relative to the extracted directory.
    #[serde(default)]
    pub medias: Vec<String>,
    #[serde(default)]
    pub points_of_interest: Vec<PointOfInterest>,
    /// Playable renditions reported once the medias became available.
    #[serde(default)]
    pub sources: Vec<MediaSource>,
}

/// Size and modification time of a source file, as seen at submission.
///
/// Two submissions of one path with the same identity are the same file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceIdentity {
    pub size: u64,
    /// Modification time, milliseconds since the Unix epoch.
    pub modified_ms: i64,
}

impl SourceIdentity {
    pub fn of(metadata: &std::fs::Metadata) -> Self {
        let modified_ms = metadata
            .modified()
            .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
            .unwrap_or_default();
        Self {
            size: metadata.len(),
            modified_ms,
        }
    }
}

// ============================================================================
// Descriptor
// ============================================================================

/// One unit of work: a source archive tracked through the pipeline.
///
/// Mutated only by the state machine driving it; the persisted copy is the
/// source of truth across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageDescriptor {
    /// Unique identifier (UUID).
    pub id: String,
    /// Absolute path of the source file in its hot folder.
    pub source_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_identity: Option<SourceIdentity>,
    pub package_type: PackageType,
    /// Owner hint from the hot folder configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Group hint from the hot folder configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Platform to publish to. `None` parks the package before upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    pub state: PackageState,
    /// Last successful checkpoint.
    pub checkpoint: Checkpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Media ids returned by the platform.
    #[serde(default)]
    pub media_ids: Vec<String>,
    #[serde(default)]
    pub metadata: PackageMetadata,
    /// Consecutive reschedules of the current checkpoint.
    #[serde(default)]
    pub reschedules: u32,
    /// Number of operator retries.
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PackageDescriptor {
    /// Creates a fresh descriptor at the given initial checkpoint.
    pub fn new(source_path: PathBuf, package_type: PackageType, initial: Checkpoint) -> Self {
        let now = Utc::now();
        let title = source_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| strip_type_suffix(n, &package_type))
            .unwrap_or_default();

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_path,
            source_identity: None,
            package_type,
            owner: None,
            group: None,
            platform: None,
            state: initial.state,
            checkpoint: initial,
            error_code: None,
            error_message: None,
            media_ids: Vec::new(),
            metadata: PackageMetadata {
                title,
                ..Default::default()
            },
            reschedules: 0,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// File name of the source, used for the copy in the work directory.
    pub fn file_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.{}", self.id, self.package_type))
    }
}

fn strip_type_suffix(name: &str, package_type: &PackageType) -> String {
    let suffix = format!(".{}", package_type);
    let Some(split) = name.len().checked_sub(suffix.len()).filter(|&n| n > 0) else {
        return name.to_string();
    };
    match (name.get(..split), name.get(split..)) {
        (Some(stem), Some(tail)) if tail.eq_ignore_ascii_case(&suffix) => stem.to_string(),
        _ => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_tags_round_trip() {
        for state in PackageState::ALL {
            assert_eq!(PackageState::parse(state.as_str()), Some(state));
        }
        assert_eq!(PackageState::parse("bogus"), None);
    }

    #[test]
    fn test_state_classification() {
        assert!(PackageState::Published.is_terminal());
        assert!(!PackageState::Error.is_terminal());
        assert!(PackageState::Error.is_stable());
        assert!(PackageState::WaitingForUpload.is_stable());
        assert!(!PackageState::Uploaded.is_stable());

        let in_progress = PackageState::in_progress();
        assert_eq!(in_progress.len(), 7);
        assert!(in_progress.contains(&PackageState::Pending));
        assert!(!in_progress.contains(&PackageState::Error));
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&PackageState::WaitingForUpload).unwrap();
        assert_eq!(json, "\"waiting_for_upload\"");
        let json = serde_json::to_string(&Transition::AwaitReady).unwrap();
        assert_eq!(json, "\"await_ready\"");
    }

    #[test]
    fn test_package_type_from_path() {
        let t = PackageType::from_path(Path::new("/hot/lecture.ZIP")).unwrap();
        assert_eq!(t.as_str(), "zip");
        assert_eq!(t.archive_kind(), Some(ArchiveKind::Zip));

        let t = PackageType::from_path(Path::new("/hot/lecture.tar.gz")).unwrap();
        assert_eq!(t.as_str(), "tar.gz");
        assert_eq!(t.archive_kind(), Some(ArchiveKind::TarGz));

        let t = PackageType::from_path(Path::new("/hot/clip.mp4")).unwrap();
        assert_eq!(t.archive_kind(), None);

        assert!(PackageType::from_path(Path::new("/hot/README")).is_none());
    }

    #[test]
    fn test_descriptor_title_strips_extension() {
        let desc = PackageDescriptor::new(
            PathBuf::from("/hot/Course 01.tar.gz"),
            PackageType::new("tar.gz"),
            Checkpoint::new(PackageState::Pending, Transition::Copy),
        );
        assert_eq!(desc.metadata.title, "Course 01");
        assert_eq!(desc.state, PackageState::Pending);
        assert_eq!(desc.file_name(), "Course 01.tar.gz");
        assert!(!desc.id.is_empty());
    }

    #[test]
    fn test_title_of_non_ascii_name() {
        let initial = Checkpoint::new(PackageState::Pending, Transition::Copy);

        // Lowercasing "İ" grows it by one byte.
        let desc = PackageDescriptor::new(
            PathBuf::from("/hot/İstanbul.ZIP"),
            PackageType::new("zip"),
            initial,
        );
        assert_eq!(desc.metadata.title, "İstanbul");

        let desc = PackageDescriptor::new(
            PathBuf::from("/hot/Ärger im Hörsaal.Tar.Gz"),
            PackageType::new("tar.gz"),
            initial,
        );
        assert_eq!(desc.metadata.title, "Ärger im Hörsaal");

        let desc = PackageDescriptor::new(PathBuf::from("/hot/.zip"), PackageType::new("zip"), initial);
        assert_eq!(desc.metadata.title, ".zip");
    }

    #[test]
    fn test_source_identity_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");
        std::fs::write(&path, b"12345").unwrap();

        let identity = SourceIdentity::of(&std::fs::metadata(&path).unwrap());
        assert_eq!(identity.size, 5);
        assert!(identity.modified_ms > 0);
        assert_eq!(identity, SourceIdentity::of(&std::fs::metadata(&path).unwrap()));
    }

    #[test]
    fn test_point_of_interest_serialization() {
        let json = r#"{"type":"chapter","timecode":1500,"data":{"name":"Intro"}}"#;
        let poi: PointOfInterest = serde_json::from_str(json).unwrap();
        assert_eq!(poi.kind, "chapter");
        assert_eq!(poi.timecode, 1500);
        assert_eq!(poi.data["name"], "Intro");
    }
}
