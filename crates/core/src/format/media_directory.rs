//! Built-in format: a directory tree of media files with an optional
//! `points.json` next to them.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::{ArchiveFormat, FormatError};
use crate::package::PointOfInterest;

/// Extensions recognised as media files (lowercase).
pub const MEDIA_EXTENSIONS: [&str; 6] = ["mp4", "mov", "mkv", "webm", "m4v", "avi"];

/// Optional JSON array of `{type, timecode, data}` objects.
pub const POINTS_FILE: &str = "points.json";

/// Accepts any directory that contains at least one media file.
///
/// Medias are every media file in the tree, sorted by relative path. Points
/// of interest come from `points.json` at the root, or else next to the
/// first media.
#[derive(Debug, Default, Clone)]
pub struct MediaDirectoryFormat;

impl MediaDirectoryFormat {
    pub fn new() -> Self {
        Self
    }

    fn media_paths(dir: &Path) -> Result<Vec<PathBuf>, FormatError> {
        let mut medias = Vec::new();
        for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| FormatError::Invalid(e.to_string()))?;
            if entry.file_type().is_file() && is_media(entry.path()) {
                medias.push(entry.into_path());
            }
        }
        Ok(medias)
    }

    fn points_file(dir: &Path, medias: &[PathBuf]) -> Option<PathBuf> {
        let root = dir.join(POINTS_FILE);
        if root.is_file() {
            return Some(root);
        }
        medias
            .first()
            .and_then(|m| m.parent())
            .map(|parent| parent.join(POINTS_FILE))
            .filter(|p| p.is_file())
    }
}

fn is_media(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| MEDIA_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn relative(dir: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(dir).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

impl ArchiveFormat for MediaDirectoryFormat {
    fn name(&self) -> &str {
        "media_directory"
    }

    fn matches(&self, dir: &Path) -> bool {
        WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .any(|e| e.file_type().is_file() && is_media(e.path()))
    }

    fn validate(&self, dir: &Path) -> Result<(), FormatError> {
        let medias = Self::media_paths(dir)?;
        if medias.is_empty() {
            return Err(FormatError::Invalid("no media file found".to_string()));
        }

        for media in &medias {
            if fs::metadata(media)?.len() == 0 {
                return Err(FormatError::Invalid(format!(
                    "media {} is empty",
                    relative(dir, media)
                )));
            }
        }

        // A malformed points file is a broken package, not a missing one.
        self.points_of_interest(dir)?;
        Ok(())
    }

    fn medias(&self, dir: &Path) -> Result<Vec<String>, FormatError> {
        Ok(Self::media_paths(dir)?
            .iter()
            .map(|p| relative(dir, p))
            .collect())
    }

    fn points_of_interest(&self, dir: &Path) -> Result<Vec<PointOfInterest>, FormatError> {
        let medias = Self::media_paths(dir)?;
        let Some(path) = Self::points_file(dir, &medias) else {
            return Ok(Vec::new());
        };

        let content = fs::read_to_string(&path)?;
        let mut points: Vec<PointOfInterest> = serde_json::from_str(&content)?;
        points.sort_by_key(|p| p.timecode);
        Ok(points)
    }
}
