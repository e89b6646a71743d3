//! Packages: the descriptors tracked through the pipeline and their store.

mod sqlite_store;
mod store;
mod types;

pub use sqlite_store::SqlitePackageStore;
pub use store::{PackageError, PackageFilter, PackageStore};
pub use types::{
    ArchiveKind, Checkpoint, ErrorCode, PackageDescriptor, PackageMetadata, PackageState,
    PackageType, PointOfInterest, SourceIdentity, Transition,
};
