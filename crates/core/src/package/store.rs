//! Package storage trait and types.

use std::path::Path;

use thiserror::Error;

use super::{PackageDescriptor, PackageState};

/// Error type for package store operations.
#[derive(Debug, Error)]
pub enum PackageError {
    /// Package not found.
    #[error("Package not found: {0}")]
    NotFound(String),

    /// Cannot perform operation due to current state.
    #[error("Cannot {operation} package {package_id}: current state is {current_state}")]
    InvalidState {
        package_id: String,
        current_state: String,
        operation: String,
    },

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),
}

/// Filter for querying packages.
#[derive(Debug, Clone, Default)]
pub struct PackageFilter {
    /// Match any of these states (empty = all states).
    pub states: Vec<PackageState>,
    /// Maximum number of results.
    pub limit: i64,
    /// Offset for pagination.
    pub offset: i64,
}

impl PackageFilter {
    /// Create a new filter with defaults.
    pub fn new() -> Self {
        Self {
            states: Vec::new(),
            limit: 100,
            offset: 0,
        }
    }

    /// Filter by a single state.
    pub fn with_state(mut self, state: PackageState) -> Self {
        self.states.push(state);
        self
    }

    /// Filter by any of several states.
    pub fn with_states(mut self, states: impl IntoIterator<Item = PackageState>) -> Self {
        self.states.extend(states);
        self
    }

    /// Set limit.
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// Set offset.
    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Keyed record store for packages.
pub trait PackageStore: Send + Sync {
    /// Insert a new package record.
    fn create(&self, package: &PackageDescriptor) -> Result<(), PackageError>;

    /// Get a package by ID.
    fn get(&self, id: &str) -> Result<Option<PackageDescriptor>, PackageError>;

    /// Overwrite the mutable fields of an existing package.
    fn save(&self, package: &PackageDescriptor) -> Result<(), PackageError>;

    /// List packages matching the filter, oldest first.
    fn list(&self, filter: &PackageFilter) -> Result<Vec<PackageDescriptor>, PackageError>;

    /// Count packages matching the filter.
    fn count(&self, filter: &PackageFilter) -> Result<i64, PackageError>;

    /// Permanently delete a package, returning it.
    fn delete(&self, id: &str) -> Result<PackageDescriptor, PackageError>;

    /// Most recent package created from the given source file.
    fn find_by_source(&self, source: &Path) -> Result<Option<PackageDescriptor>, PackageError>;
}
