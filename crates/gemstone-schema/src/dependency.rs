//! Declared dependencies between packages.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::version::{Requirement, Version};

/// Whether a dependency is needed at runtime or only for development.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// Activated and installed alongside the dependent package.
    #[default]
    Runtime,
    /// Ignored by activation and installation.
    Development,
}

impl DependencyKind {
    /// Lowercase name as written in descriptors.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Runtime => "runtime",
            Self::Development => "development",
        }
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named package plus the versions of it that are acceptable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    /// Name of the required package.
    pub name: String,
    /// Acceptable versions. Defaults to `> 0.0.0`.
    #[serde(default)]
    pub requirement: Requirement,
    /// Runtime or development.
    #[serde(default)]
    pub kind: DependencyKind,
}

impl Dependency {
    /// A runtime dependency.
    pub fn new(name: impl Into<String>, requirement: Requirement) -> Self {
        Self {
            name: name.into(),
            requirement,
            kind: DependencyKind::Runtime,
        }
    }

    /// A development-only dependency.
    pub fn development(name: impl Into<String>, requirement: Requirement) -> Self {
        Self {
            kind: DependencyKind::Development,
            ..Self::new(name, requirement)
        }
    }

    /// Whether `name`/`version` satisfies this dependency.
    pub fn matches(&self, name: &str, version: &Version) -> bool {
        self.name == name && self.requirement.satisfied_by(version)
    }

    /// Whether this dependency participates in activation and installation.
    pub fn is_runtime(&self) -> bool {
        self.kind == DependencyKind::Runtime
    }
}

/// Renders as `name (requirement, kind)`, e.g. `b (> 2, runtime)`.
impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.name, self.requirement, self.kind)
    }
}
