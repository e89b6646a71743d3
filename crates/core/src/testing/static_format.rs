//! Format strategy with canned answers.

use std::path::Path;

use crate::format::{ArchiveFormat, FormatError};
use crate::package::PointOfInterest;

/// Format strategy that ignores the directory contents.
#[derive(Debug, Clone)]
pub struct StaticFormat {
    name: String,
    matches: bool,
    valid: bool,
    medias: Vec<String>,
    points: Vec<PointOfInterest>,
}

impl StaticFormat {
    /// Claims every directory and reports the given medias.
    pub fn accepting(name: &str, medias: Vec<&str>) -> Self {
        Self {
            name: name.to_string(),
            matches: true,
            valid: true,
            medias: medias.into_iter().map(String::from).collect(),
            points: Vec::new(),
        }
    }

    /// Never claims a directory.
    pub fn rejecting(name: &str) -> Self {
        Self {
            matches: false,
            ..Self::accepting(name, Vec::new())
        }
    }

    /// Claims every directory but fails validation.
    pub fn invalid(name: &str) -> Self {
        Self {
            valid: false,
            ..Self::accepting(name, Vec::new())
        }
    }

    pub fn with_points(mut self, points: Vec<PointOfInterest>) -> Self {
        self.points = points;
        self
    }
}

impl ArchiveFormat for StaticFormat {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, _dir: &Path) -> bool {
        self.matches
    }

    fn validate(&self, _dir: &Path) -> Result<(), FormatError> {
        if self.valid {
            Ok(())
        } else {
            Err(FormatError::Invalid(format!("{} rejected the package", self.name)))
        }
    }

    fn medias(&self, _dir: &Path) -> Result<Vec<String>, FormatError> {
        Ok(self.medias.clone())
    }

    fn points_of_interest(&self, _dir: &Path) -> Result<Vec<PointOfInterest>, FormatError> {
        Ok(self.points.clone())
    }
}
