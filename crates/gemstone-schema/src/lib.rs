//! Shared types for gemstone.
//!
//! Everything in this crate is pure data: versions and the requirements
//! that select them, platform tags for binary packages, and the
//! [`Specification`] descriptor that every installed package carries.
//! The engine crate (`gemstone-core`) builds activation and installation
//! on top of these types.

pub mod dependency;
pub mod platform;
pub mod specification;
pub mod version;

// Re-exports
pub use dependency::{Dependency, DependencyKind};
pub use platform::{Platform, PlatformTag};
pub use specification::{Specification, SpecificationError};
pub use version::{FormatError, Op, Requirement, Version};

/// Version of the package manager itself. Stamped into every descriptor as
/// its schema version and checked against `required_package_manager_version`.
pub const GEMSTONE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// File extension of descriptor files in the package index.
pub const DESCRIPTOR_EXTENSION: &str = "spec";
