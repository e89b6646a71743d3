//! Testing utilities and mock implementations.
//!
//! Provides a mock platform and canned format strategies so the full
//! pipeline can run without a real media platform.
//!
//! # Example
//!
//! ```rust,ignore
//! use hotfolder_core::testing::{fixtures, MockPlatform};
//!
//! let platform = Arc::new(MockPlatform::new("vod"));
//! platform.set_ready_after(1).await;
//!
//! fixtures::write_zip(&hot.join("course.zip"), &[("a.mp4", b"video")]);
//! ```

mod mock_platform;
mod static_format;

pub use mock_platform::{MockPlatform, RecordedUpdate, RecordedUpload};
pub use static_format::StaticFormat;

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::fs::File;
    use std::io::Write;
    use std::path::{Path, PathBuf};

    use flate2::write::GzEncoder;
    use flate2::Compression;

    use crate::package::{Checkpoint, PackageDescriptor, PackageState, PackageType, Transition};

    /// Write a zip archive with the given `(name, content)` entries.
    pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, content) in entries {
            writer
                .start_file(*name, zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
    }

    /// Write an uncompressed tar archive.
    pub fn write_tar(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let builder = append_tar(tar::Builder::new(file), entries);
        builder.into_inner().unwrap();
    }

    /// Write a gzipped tar archive.
    pub fn write_tar_gz(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let builder = append_tar(tar::Builder::new(encoder), entries);
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn append_tar<W: Write>(
        mut builder: tar::Builder<W>,
        entries: &[(&str, &[u8])],
    ) -> tar::Builder<W> {
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder
    }

    /// A fresh descriptor at the first pipeline checkpoint.
    pub fn package(source: impl Into<PathBuf>) -> PackageDescriptor {
        let source = source.into();
        let package_type = PackageType::from_path(&source).unwrap_or_else(|| PackageType::new("zip"));
        PackageDescriptor::new(
            source,
            package_type,
            Checkpoint::new(PackageState::Pending, Transition::Copy),
        )
    }
}
