//! Archive inspection and extraction for zip, tar and gzipped tar packages.
//!
//! Everything here blocks; the steps call it through `spawn_blocking`.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::EntryType;
use thiserror::Error;
use zip::ZipArchive;

use crate::package::ArchiveKind;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Archive entry escapes the extraction root: {0}")]
    UnsafePath(String),
}

/// Opens the archive, walks every entry and returns how many there are.
///
/// Fails on unreadable archives and on entries that would land outside the
/// extraction root.
pub fn inspect(path: &Path, kind: ArchiveKind) -> Result<usize, ArchiveError> {
    match kind {
        ArchiveKind::Zip => {
            let mut archive = ZipArchive::new(File::open(path)?)?;
            for index in 0..archive.len() {
                let entry = archive.by_index(index)?;
                sanitize_entry_path(Path::new(entry.name()))?;
            }
            Ok(archive.len())
        }
        ArchiveKind::Tar => inspect_tar(File::open(path)?),
        ArchiveKind::TarGz => inspect_tar(GzDecoder::new(File::open(path)?)),
    }
}

fn inspect_tar<R: Read>(reader: R) -> Result<usize, ArchiveError> {
    let mut archive = tar::Archive::new(reader);
    let mut count = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        sanitize_entry_path(&entry.path()?)?;
        // Read through the payload so truncated archives are caught here.
        io::copy(&mut entry, &mut io::sink())?;
        count += 1;
    }
    Ok(count)
}

/// Unpacks the archive under `target`, which must exist.
pub fn extract(path: &Path, kind: ArchiveKind, target: &Path) -> Result<(), ArchiveError> {
    match kind {
        ArchiveKind::Zip => extract_zip(path, target),
        ArchiveKind::Tar => extract_tar(File::open(path)?, target),
        ArchiveKind::TarGz => extract_tar(GzDecoder::new(File::open(path)?), target),
    }
}

fn extract_zip(path: &Path, target: &Path) -> Result<(), ArchiveError> {
    let mut archive = ZipArchive::new(File::open(path)?)?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let destination = target.join(sanitize_entry_path(Path::new(entry.name()))?);

        if entry.is_dir() {
            fs::create_dir_all(&destination)?;
            continue;
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut output = File::create(&destination)?;
        io::copy(&mut entry, &mut output)?;
    }

    Ok(())
}

fn extract_tar<R: Read>(reader: R, target: &Path) -> Result<(), ArchiveError> {
    let mut archive = tar::Archive::new(reader);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let destination = target.join(sanitize_entry_path(&entry.path()?)?);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&destination)?;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = destination.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut output = File::create(&destination)?;
                io::copy(&mut entry, &mut output)?;
            }
            // Links and special files are not part of a media package.
            _ => {}
        }
    }

    Ok(())
}

/// Turns an entry name into a relative path, rejecting absolute paths and
/// parent references.
pub fn sanitize_entry_path(entry: &Path) -> Result<PathBuf, ArchiveError> {
    let unsafe_path = || ArchiveError::UnsafePath(entry.display().to_string());

    if entry.is_absolute() {
        return Err(unsafe_path());
    }

    let mut sanitized = PathBuf::new();
    for component in entry.components() {
        match component {
            Component::Normal(segment) => sanitized.push(segment),
            Component::CurDir => {}
            _ => return Err(unsafe_path()),
        }
    }
    Ok(sanitized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_rejects_unsafe_inputs() {
        assert!(sanitize_entry_path(Path::new("/etc/passwd")).is_err());
        assert!(sanitize_entry_path(Path::new("../escape.mp4")).is_err());
        assert!(sanitize_entry_path(Path::new("a/../../b")).is_err());
        assert_eq!(
            sanitize_entry_path(Path::new("./course/a.mp4")).unwrap(),
            PathBuf::from("course/a.mp4")
        );
    }

    #[test]
    fn test_zip_inspect_and_extract() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("pkg.zip");
        fixtures::write_zip(
            &archive,
            &[("course/a.mp4", b"video-a"), ("course/points.json", b"[]")],
        );

        assert_eq!(inspect(&archive, ArchiveKind::Zip).unwrap(), 2);

        let target = dir.path().join("out");
        fs::create_dir(&target).unwrap();
        extract(&archive, ArchiveKind::Zip, &target).unwrap();
        assert_eq!(fs::read(target.join("course/a.mp4")).unwrap(), b"video-a");
    }

    #[test]
    fn test_tar_gz_inspect_and_extract() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("pkg.tar.gz");
        fixtures::write_tar_gz(&archive, &[("a.mp4", b"video"), ("b.mov", b"more")]);

        assert_eq!(inspect(&archive, ArchiveKind::TarGz).unwrap(), 2);

        let target = dir.path().join("out");
        fs::create_dir(&target).unwrap();
        extract(&archive, ArchiveKind::TarGz, &target).unwrap();
        assert_eq!(fs::read(target.join("b.mov")).unwrap(), b"more");
    }

    #[test]
    fn test_zip_with_escaping_entry_rejected() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("evil.zip");
        fixtures::write_zip(&archive, &[("../evil.mp4", b"x")]);

        let err = inspect(&archive, ArchiveKind::Zip).unwrap_err();
        assert!(matches!(err, ArchiveError::UnsafePath(_)));
    }

    #[test]
    fn test_garbage_is_not_an_archive() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("broken.zip");
        fs::write(&archive, b"definitely not a zip").unwrap();

        assert!(inspect(&archive, ArchiveKind::Zip).is_err());
    }
}
