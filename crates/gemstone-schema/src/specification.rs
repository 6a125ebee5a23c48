//! The package descriptor.
//!
//! A [`Specification`] describes one released package: identity, file
//! manifest, dependencies and the runtime constraints it was built for. It is
//! persisted as a data-only TOML "descriptor" (see
//! [`Specification::to_descriptor`]); decoding never executes anything.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::GEMSTONE_VERSION;
use crate::dependency::{Dependency, DependencyKind};
use crate::platform::{Platform, PlatformTag};
use crate::version::{Requirement, Version};

/// Errors raised while validating or decoding a specification.
#[derive(Error, Debug)]
pub enum SpecificationError {
    /// A required attribute is empty, or the manifest is inconsistent.
    #[error("{0}")]
    Invalid(String),

    /// A descriptor decoded cleanly but lacks a required attribute.
    #[error("malformed specification: {0}")]
    Malformed(String),

    /// The descriptor is not valid TOML or has unexpected keys.
    #[error("failed to parse descriptor: {0}")]
    Parse(#[from] toml::de::Error),

    /// The specification could not be serialized.
    #[error("failed to serialize descriptor: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Reading a descriptor file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Directory executables live in when a package does not declare one.
pub const DEFAULT_BINDIR: &str = "bin";

/// Metadata for a single released package.
#[derive(Debug, Clone)]
pub struct Specification {
    /// Package-manager version that wrote the descriptor.
    pub schema_version: String,
    /// Package name.
    pub name: String,
    /// Package version.
    pub version: Version,
    /// Release date.
    pub date: NaiveDate,
    /// One-line summary.
    pub summary: String,
    /// Directories, relative to the package root, added to the load path on
    /// activation.
    pub require_paths: Vec<String>,
    /// Target platform.
    pub platform: PlatformTag,
    /// Author name.
    pub author: Option<String>,
    /// Contact address.
    pub email: Option<String>,
    /// Project homepage.
    pub homepage: Option<String>,
    /// Longer description.
    pub description: Option<String>,
    /// Files shipped in the package, relative to its root.
    pub files: Vec<String>,
    /// Executable names found under [`bindir`](Self::bindir).
    pub executables: Vec<String>,
    /// Native extension build files, relative to the package root.
    pub extensions: Vec<String>,
    /// Directory holding executables.
    pub bindir: Option<String>,
    /// Executable run when the package itself is invoked.
    pub default_executable: Option<String>,
    /// File loaded automatically on activation.
    pub autorequire: Option<String>,
    /// Interpreter versions this package supports.
    pub required_runtime_version: Option<Requirement>,
    /// Package-manager versions this package supports.
    pub required_package_manager_version: Option<Requirement>,
    /// Declared dependencies, runtime and development.
    pub dependencies: Vec<Dependency>,
    /// External requirements shown to users (free text).
    pub requirements: Vec<String>,
    /// Message printed after a successful install.
    pub post_install_message: Option<String>,
    /// Descriptor file this specification was read from.
    pub loaded_from: Option<PathBuf>,
    /// Set once the activation engine has selected this specification.
    pub loaded: bool,
}

static HYPHEN_BREAK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\w-)\n[ \t]*(\w)").unwrap_or_else(|e| panic!("bad pattern: {e}"))
});

static LINE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*").unwrap_or_else(|e| panic!("bad pattern: {e}")));

/// Collapse multi-line text to one line, joining hyphenated breaks.
fn normalize_text(text: &str) -> String {
    let joined = HYPHEN_BREAK.replace_all(text.trim(), "$1$2");
    LINE_BREAK.replace_all(&joined, " ").into_owned()
}

impl Specification {
    /// A specification with the given identity and defaults everywhere else:
    /// today's date, the generic platform and a `lib` require path.
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            schema_version: GEMSTONE_VERSION.to_string(),
            name: name.into(),
            version,
            date: chrono::Utc::now().date_naive(),
            summary: String::new(),
            require_paths: vec!["lib".to_string()],
            platform: PlatformTag::Generic,
            author: None,
            email: None,
            homepage: None,
            description: None,
            files: Vec::new(),
            executables: Vec::new(),
            extensions: Vec::new(),
            bindir: None,
            default_executable: None,
            autorequire: None,
            required_runtime_version: None,
            required_package_manager_version: None,
            dependencies: Vec::new(),
            requirements: Vec::new(),
            post_install_message: None,
            loaded_from: None,
            loaded: false,
        }
    }

    /// Set the summary, collapsing it to a single line.
    pub fn set_summary(&mut self, summary: &str) {
        self.summary = normalize_text(summary);
    }

    /// Set the description, collapsing it to a single line.
    pub fn set_description(&mut self, description: &str) {
        self.description = Some(normalize_text(description));
    }

    /// Replace the require paths with a single entry.
    pub fn set_require_path(&mut self, path: impl Into<String>) {
        self.require_paths = vec![path.into()];
    }

    /// Declare a runtime dependency.
    pub fn add_dependency(&mut self, name: impl Into<String>, requirement: Requirement) {
        self.dependencies.push(Dependency::new(name, requirement));
    }

    /// Declare a development dependency.
    pub fn add_development_dependency(
        &mut self,
        name: impl Into<String>,
        requirement: Requirement,
    ) {
        self.dependencies
            .push(Dependency::development(name, requirement));
    }

    /// Dependencies needed at runtime.
    pub fn runtime_dependencies(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies
            .iter()
            .filter(|d| d.kind == DependencyKind::Runtime)
    }

    /// Executable directory, falling back to [`DEFAULT_BINDIR`].
    pub fn bindir(&self) -> &str {
        self.bindir.as_deref().unwrap_or(DEFAULT_BINDIR)
    }

    /// `name-version` for generic packages, `name-version-platform`
    /// otherwise. A `current` platform is rendered as the host platform.
    pub fn full_name(&self) -> String {
        match self.platform.resolve() {
            None => format!("{}-{}", self.name, self.version),
            Some(platform) => format!("{}-{}-{}", self.name, self.version, platform),
        }
    }

    /// Install root this specification was loaded from: the parent of the
    /// directory holding its descriptor.
    pub fn installation_path(&self) -> Option<&Path> {
        self.loaded_from.as_deref()?.parent()?.parent()
    }

    /// Root directory of the installed package files.
    pub fn full_gem_path(&self) -> Option<PathBuf> {
        self.installation_path()
            .map(|root| root.join("gems").join(self.full_name()))
    }

    /// Every shipped file: the manifest plus executables and extension
    /// build files, sorted and without duplicates.
    pub fn all_files(&self) -> Vec<String> {
        let bindir = self.bindir();
        let mut all: Vec<String> = self
            .files
            .iter()
            .cloned()
            .chain(self.executables.iter().map(|exe| format!("{bindir}/{exe}")))
            .chain(self.extensions.iter().cloned())
            .collect();
        all.sort();
        all.dedup();
        all
    }

    /// Whether this specification satisfies `dependency`.
    pub fn satisfies_requirement(&self, dependency: &Dependency) -> bool {
        dependency.matches(&self.name, &self.version)
    }

    /// Whether this package runs on any of the `known` platforms.
    pub fn matches_platforms(&self, known: &[PlatformTag]) -> bool {
        Platform::matches_any(&self.platform, known)
    }

    /// Stamp the running package-manager version as the schema version.
    pub fn mark_version(&mut self) {
        self.schema_version = GEMSTONE_VERSION.to_string();
    }

    /// Check that every required attribute is set and that the name and
    /// executables are plain file names.
    ///
    /// # Errors
    ///
    /// Returns [`SpecificationError::Invalid`] naming the first empty or
    /// malformed attribute, or when no require path is declared.
    pub fn validate(&self) -> Result<(), SpecificationError> {
        let required = [
            ("schema_version", self.schema_version.is_empty()),
            ("name", self.name.trim().is_empty()),
            ("summary", self.summary.trim().is_empty()),
        ];
        if let Some((attr, _)) = required.iter().find(|(_, missing)| *missing) {
            return Err(SpecificationError::Invalid(format!(
                "missing value for attribute {attr}"
            )));
        }

        if !is_plain_file_name(&self.name) {
            return Err(SpecificationError::Invalid(format!(
                "invalid value for attribute name: {:?}",
                self.name
            )));
        }

        if let Some(exe) = self.executables.iter().find(|e| !is_plain_file_name(e)) {
            return Err(SpecificationError::Invalid(format!(
                "invalid value for attribute executables: {exe:?}"
            )));
        }

        if self.require_paths.is_empty() {
            return Err(SpecificationError::Invalid(
                "specification needs at least one require path".to_string(),
            ));
        }

        Ok(())
    }

    /// Serialize to a descriptor.
    ///
    /// Keys are emitted in a fixed order: `schema_version`, `name`,
    /// `version`, `platform`, `summary`, `files`, `require_paths`, `date`,
    /// then optional keys that are set, then `[[dependencies]]` tables.
    ///
    /// # Errors
    ///
    /// Returns [`SpecificationError::Serialize`] if TOML encoding fails.
    pub fn to_descriptor(&self) -> Result<String, SpecificationError> {
        let descriptor = Descriptor::from(self);
        Ok(toml::to_string(&descriptor)?)
    }

    /// Decode a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`SpecificationError::Parse`] for invalid TOML or unknown
    /// keys, and [`SpecificationError::Malformed`] naming the first required
    /// attribute that is missing.
    pub fn from_descriptor(text: &str) -> Result<Self, SpecificationError> {
        let descriptor: Descriptor = toml::from_str(text)?;
        descriptor.into_specification()
    }

    /// Read and decode a descriptor file, recording where it came from.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or does not decode.
    pub fn from_file(path: &Path) -> Result<Self, SpecificationError> {
        let text = std::fs::read_to_string(path)?;
        let mut spec = Self::from_descriptor(&text)?;
        spec.loaded_from = Some(path.to_path_buf());
        Ok(spec)
    }
}

impl fmt::Display for Specification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}

impl PartialEq for Specification {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.version == other.version && self.platform == other.platform
    }
}

impl Eq for Specification {}

impl Ord for Specification {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.version.cmp(&other.version))
            .then_with(|| self.platform.to_string().cmp(&other.platform.to_string()))
    }
}

impl PartialOrd for Specification {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Wire form of a specification. Field order is the emission order.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Descriptor {
    schema_version: Option<String>,
    name: Option<String>,
    version: Option<Version>,
    platform: Option<PlatformTag>,
    summary: Option<String>,
    files: Option<Vec<String>>,
    require_paths: Option<Vec<String>>,
    date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    homepage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bindir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    executables: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    extensions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    default_executable: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    autorequire: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    required_runtime_version: Option<Requirement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    required_package_manager_version: Option<Requirement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    requirements: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    post_install_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    dependencies: Vec<Dependency>,
}

fn non_empty(list: &[String]) -> Option<Vec<String>> {
    (!list.is_empty()).then(|| list.to_vec())
}

impl From<&Specification> for Descriptor {
    fn from(spec: &Specification) -> Self {
        Self {
            schema_version: Some(spec.schema_version.clone()),
            name: Some(spec.name.clone()),
            version: Some(spec.version.clone()),
            platform: Some(spec.platform.clone()),
            summary: Some(spec.summary.clone()),
            files: Some(spec.files.clone()),
            require_paths: Some(spec.require_paths.clone()),
            date: Some(spec.date),
            author: spec.author.clone(),
            email: spec.email.clone(),
            homepage: spec.homepage.clone(),
            description: spec.description.clone(),
            bindir: spec.bindir.clone(),
            executables: non_empty(&spec.executables),
            extensions: non_empty(&spec.extensions),
            default_executable: spec.default_executable.clone(),
            autorequire: spec.autorequire.clone(),
            required_runtime_version: spec.required_runtime_version.clone(),
            required_package_manager_version: spec.required_package_manager_version.clone(),
            requirements: non_empty(&spec.requirements),
            post_install_message: spec.post_install_message.clone(),
            dependencies: spec.dependencies.clone(),
        }
    }
}

fn required<T>(value: Option<T>, attr: &str) -> Result<T, SpecificationError> {
    value.ok_or_else(|| {
        SpecificationError::Malformed(format!("missing value for attribute {attr}"))
    })
}

impl Descriptor {
    fn into_specification(self) -> Result<Specification, SpecificationError> {
        // checked in required-attribute order so the first gap is reported
        let schema_version = required(self.schema_version, "schema_version")?;
        let name = required(self.name, "name")?;
        let date = required(self.date, "date")?;
        let summary = required(self.summary, "summary")?;
        let require_paths = required(self.require_paths, "require_paths")?;
        let version = required(self.version, "version")?;

        Ok(Specification {
            schema_version,
            name,
            version,
            date,
            summary,
            require_paths,
            platform: self.platform.unwrap_or_default(),
            author: self.author,
            email: self.email,
            homepage: self.homepage,
            description: self.description,
            files: self.files.unwrap_or_default(),
            executables: self.executables.unwrap_or_default(),
            extensions: self.extensions.unwrap_or_default(),
            bindir: self.bindir,
            default_executable: self.default_executable,
            autorequire: self.autorequire,
            required_runtime_version: self.required_runtime_version,
            required_package_manager_version: self.required_package_manager_version,
            dependencies: self.dependencies,
            requirements: self.requirements.unwrap_or_default(),
            post_install_message: self.post_install_message,
            loaded_from: None,
            loaded: false,
        })
    }
}

/// A single path component: no separators, no `.`/`..`, no NUL.
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Specification {
        let mut spec = Specification::new("a", Version::new("2").unwrap());
        spec.set_summary("this is a summary");
        spec.date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        spec.files = vec!["lib/code.rb".to_string()];
        spec
    }

    #[test]
    fn test_full_name() {
        let mut spec = sample();
        assert_eq!(spec.full_name(), "a-2");

        spec.platform = PlatformTag::parse("x86-mswin32-60");
        assert_eq!(spec.full_name(), "a-2-x86-mswin32-60");

        spec.platform = PlatformTag::Current;
        assert_eq!(spec.full_name(), format!("a-2-{}", Platform::local()));
    }

    #[test]
    fn test_summary_normalization() {
        let mut spec = sample();
        spec.set_summary("  a multi-\n   line\n\tsummary  ");
        assert_eq!(spec.summary, "a multi-line summary");

        spec.set_description("first\n  second");
        assert_eq!(spec.description.as_deref(), Some("first second"));
    }

    #[test]
    fn test_installation_paths() {
        let mut spec = sample();
        assert!(spec.installation_path().is_none());
        assert!(spec.full_gem_path().is_none());

        spec.loaded_from = Some(PathBuf::from("/opt/gems/specifications/a-2.spec"));
        assert_eq!(spec.installation_path(), Some(Path::new("/opt/gems")));
        assert_eq!(spec.full_gem_path(), Some(PathBuf::from("/opt/gems/gems/a-2")));
    }

    #[test]
    fn test_validate() {
        assert!(sample().validate().is_ok());

        let mut spec = sample();
        spec.summary.clear();
        let err = spec.validate().unwrap_err();
        assert_eq!(err.to_string(), "missing value for attribute summary");

        let mut spec = sample();
        spec.require_paths.clear();
        let err = spec.validate().unwrap_err();
        assert_eq!(err.to_string(), "specification needs at least one require path");
    }

    #[test]
    fn test_validate_rejects_path_like_names() {
        for name in ["../../escaped", "a/b", "a\\b", "..", ".", "nul\0byte"] {
            let mut spec = sample();
            spec.name = name.to_string();
            let err = spec.validate().unwrap_err();
            assert!(err.to_string().starts_with("invalid value for attribute name"), "{name}");
        }

        let mut spec = sample();
        spec.name = "dotted..name".to_string();
        assert!(spec.validate().is_ok());

        let mut spec = sample();
        spec.executables = vec!["tool".to_string(), "../../../victim.txt".to_string()];
        let err = spec.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid value for attribute executables: \"../../../victim.txt\""
        );
    }

    #[test]
    fn test_descriptor_round_trip() {
        let mut spec = sample();
        spec.author = Some("A User".to_string());
        spec.executables = vec!["tool".to_string()];
        spec.bindir = Some("bin".to_string());
        spec.required_runtime_version = Some(Requirement::parse(">= 1.8").unwrap());
        spec.add_dependency("b", Requirement::parse(">= 1").unwrap());
        spec.add_development_dependency("rake", Requirement::default());
        spec.post_install_message = Some("thanks".to_string());

        let text = spec.to_descriptor().unwrap();
        let decoded = Specification::from_descriptor(&text).unwrap();

        assert_eq!(decoded, spec);
        assert_eq!(decoded.date, spec.date);
        assert_eq!(decoded.summary, spec.summary);
        assert_eq!(decoded.author, spec.author);
        assert_eq!(decoded.executables, spec.executables);
        assert_eq!(decoded.dependencies, spec.dependencies);
        assert_eq!(decoded.required_runtime_version, spec.required_runtime_version);
        assert_eq!(decoded.post_install_message, spec.post_install_message);
        assert!(decoded.loaded_from.is_none());
    }

    #[test]
    fn test_descriptor_field_order() {
        let mut spec = sample();
        spec.homepage = Some("https://example.org".to_string());
        spec.add_dependency("b", Requirement::default());
        let text = spec.to_descriptor().unwrap();

        let keys = [
            "schema_version =",
            "name =",
            "version =",
            "platform =",
            "summary =",
            "files =",
            "require_paths =",
            "date =",
            "homepage =",
            "[[dependencies]]",
        ];
        let positions: Vec<usize> = keys
            .iter()
            .map(|k| text.find(k).unwrap_or_else(|| panic!("{k} missing in\n{text}")))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "order wrong:\n{text}");
        assert!(!text.contains("author"));
    }

    #[test]
    fn test_descriptor_missing_required() {
        let text = r#"
schema_version = "0.1.0"
name = "a"
version = "1"
summary = "s"
require_paths = ["lib"]
"#;
        let err = Specification::from_descriptor(text).unwrap_err();
        assert!(matches!(err, SpecificationError::Malformed(_)));
        assert!(err.to_string().contains("date"));
    }

    #[test]
    fn test_descriptor_rejects_unknown_keys() {
        let mut text = sample().to_descriptor().unwrap();
        text.insert_str(0, "install_hook = \"rm -rf /\"\n");
        let err = Specification::from_descriptor(&text).unwrap_err();
        assert!(matches!(err, SpecificationError::Parse(_)));
    }

    #[test]
    fn test_from_file_sets_loaded_from() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a-2.spec");
        std::fs::write(&path, sample().to_descriptor().unwrap()).unwrap();

        let spec = Specification::from_file(&path).unwrap();
        assert_eq!(spec.loaded_from.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn test_all_files_and_runtime_dependencies() {
        let mut spec = sample();
        spec.executables = vec!["tool".to_string()];
        spec.extensions = vec!["ext/extconf.rb".to_string()];
        spec.add_dependency("b", Requirement::default());
        spec.add_development_dependency("c", Requirement::default());

        assert_eq!(
            spec.all_files(),
            vec!["bin/tool", "ext/extconf.rb", "lib/code.rb"]
        );
        let names: Vec<&str> = spec.runtime_dependencies().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["b"]);
    }

    #[test]
    fn test_ordering() {
        let mut specs = vec![
            Specification::new("b", Version::new("1").unwrap()),
            Specification::new("a", Version::new("10").unwrap()),
            Specification::new("a", Version::new("9").unwrap()),
        ];
        specs.sort();
        let names: Vec<String> = specs.iter().map(Specification::full_name).collect();
        assert_eq!(names, vec!["a-9", "a-10", "b-1"]);
    }
}
