//! Core library for gemstone.
//!
//! Selects and activates installed packages ([`ActivationEngine`]) and
//! installs package archives into an install root ([`Installer`]). The data
//! types these operate on live in `gemstone-schema` and are re-exported here.

pub mod activation;
pub mod archive;
pub mod config;
pub mod ext;
pub mod index;
pub mod installer;
pub mod lock;
pub mod reporter;

pub use activation::{ActivationEngine, ActivationError, Loader, SearchPathLoader, SharedEngine};
pub use archive::{Archive, FileEntry, MemoryArchive, PackageArchive, PackageBuilder, PackageError};
pub use config::{Config, ConfigError};
pub use ext::{BuilderRegistry, ExtensionBuildError, ExtensionBuilder};
pub use index::{SourceIndex, SpecSource, contents};
pub use installer::{FilePermissionError, InstallError, InstallOptions, Installer};
pub use lock::InstallLock;
pub use reporter::{NullReporter, Reporter};

pub use gemstone_schema::{
    Dependency, DependencyKind, Platform, PlatformTag, Requirement, Specification, Version,
};
