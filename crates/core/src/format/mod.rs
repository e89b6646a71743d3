//! Archive format strategies.
//!
//! A strategy inspects an extracted package directory and tells the pipeline
//! which files are medias and which points of interest go with them. The
//! pipeline picks the first registered strategy that claims the directory.

mod media_directory;

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

pub use media_directory::{MediaDirectoryFormat, MEDIA_EXTENSIONS, POINTS_FILE};

use crate::package::PointOfInterest;

/// Errors raised by a format strategy.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid package: {0}")]
    Invalid(String),

    #[error("Invalid points of interest: {0}")]
    Points(#[from] serde_json::Error),
}

/// Strategy for one package layout.
///
/// Methods read the filesystem and block; callers run them off the async
/// runtime.
pub trait ArchiveFormat: Send + Sync {
    /// Strategy name, recorded in the package metadata.
    fn name(&self) -> &str;

    /// Returns true if this strategy understands the directory.
    fn matches(&self, dir: &Path) -> bool;

    /// Checks the package contents are complete and consistent.
    fn validate(&self, dir: &Path) -> Result<(), FormatError>;

    /// Media files, relative to `dir`, in publishing order.
    fn medias(&self, dir: &Path) -> Result<Vec<String>, FormatError>;

    fn points_of_interest(&self, dir: &Path) -> Result<Vec<PointOfInterest>, FormatError>;
}

/// Ordered list of strategies.
#[derive(Clone, Default)]
pub struct FormatRegistry {
    formats: Vec<Arc<dyn ArchiveFormat>>,
}

impl FormatRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in strategies.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(MediaDirectoryFormat::new()));
        registry
    }

    /// Append a strategy. Earlier registrations win.
    pub fn register(&mut self, format: Arc<dyn ArchiveFormat>) {
        self.formats.push(format);
    }

    /// First strategy whose `matches` holds for the directory.
    pub fn select(&self, dir: &Path) -> Option<Arc<dyn ArchiveFormat>> {
        self.formats.iter().find(|f| f.matches(dir)).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.formats.iter().map(|f| f.name()).collect()
    }
}

impl std::fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatRegistry")
            .field("formats", &self.names())
            .finish()
    }
}
