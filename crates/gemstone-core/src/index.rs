//! Installed package index.
//!
//! [`SpecSource`] is the seam activation and installation query installed
//! packages through. [`SourceIndex`] is the in-memory implementation, loaded
//! from the `specifications/` directories of one or more install roots.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use gemstone_schema::{DESCRIPTOR_EXTENSION, Requirement, Specification};
use tracing::{debug, warn};

/// Lookup of installed specifications by name.
pub trait SpecSource {
    /// Every installed specification named `name`, unfiltered.
    fn find_by_name(&self, name: &str) -> Vec<Specification>;
}

/// In-memory index of installed specifications, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct SourceIndex {
    specs: BTreeMap<String, Vec<Specification>>,
}

impl SourceIndex {
    /// An empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.spec` descriptor found directly in `dirs`.
    ///
    /// Missing directories are skipped. Descriptors that fail to decode are
    /// logged and skipped so one bad file does not hide the rest.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing directory cannot be listed.
    pub fn from_dirs(dirs: &[PathBuf]) -> std::io::Result<Self> {
        let mut index = Self::new();

        for dir in dirs {
            if !dir.is_dir() {
                debug!("Skipping missing spec dir {}", dir.display());
                continue;
            }

            let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| {
                    path.extension()
                        .is_some_and(|ext| ext == DESCRIPTOR_EXTENSION)
                })
                .collect();
            paths.sort();

            for path in paths {
                match Specification::from_file(&path) {
                    Ok(spec) => index.add(spec),
                    Err(e) => warn!("Skipping invalid descriptor {}: {e}", path.display()),
                }
            }
        }

        debug!("Loaded {} installed specifications", index.len());
        Ok(index)
    }

    /// Add a specification, replacing any with the same full name.
    pub fn add(&mut self, spec: Specification) {
        let entries = self.specs.entry(spec.name.clone()).or_default();
        entries.retain(|existing| existing.full_name() != spec.full_name());
        entries.push(spec);
        entries.sort();
    }

    /// Number of specifications.
    pub fn len(&self) -> usize {
        self.specs.values().map(Vec::len).sum()
    }

    /// Whether the index holds nothing.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// All specifications, ordered by name then version.
    pub fn iter(&self) -> impl Iterator<Item = &Specification> {
        self.specs.values().flatten()
    }

    /// Specifications named `name` satisfying `requirement`, ascending.
    pub fn search(&self, name: &str, requirement: &Requirement) -> Vec<&Specification> {
        self.specs
            .get(name)
            .map(|specs| {
                specs
                    .iter()
                    .filter(|spec| requirement.satisfied_by(&spec.version))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Highest specification named `name` satisfying `requirement`.
    pub fn find(&self, name: &str, requirement: &Requirement) -> Option<&Specification> {
        self.search(name, requirement).pop()
    }

    /// The newest specification of every package.
    pub fn latest_specs(&self) -> Vec<&Specification> {
        self.specs.values().filter_map(|specs| specs.last()).collect()
    }

    /// Load-path entries for every installed version of every package.
    pub fn all_load_paths(&self) -> Vec<PathBuf> {
        self.iter().flat_map(require_dirs).collect()
    }

    /// Load-path entries for the newest version of every package.
    pub fn latest_load_paths(&self) -> Vec<PathBuf> {
        self.latest_specs().into_iter().flat_map(require_dirs).collect()
    }
}

fn require_dirs(spec: &Specification) -> Vec<PathBuf> {
    let Some(root) = spec.full_gem_path() else {
        return Vec::new();
    };
    spec.require_paths.iter().map(|p| root.join(p)).collect()
}

impl SpecSource for SourceIndex {
    fn find_by_name(&self, name: &str) -> Vec<Specification> {
        self.specs.get(name).cloned().unwrap_or_default()
    }
}

impl<T: SpecSource + ?Sized> SpecSource for std::sync::Arc<T> {
    fn find_by_name(&self, name: &str) -> Vec<Specification> {
        (**self).find_by_name(name)
    }
}

/// Files of the highest installed `name` matching `requirement`, joined
/// under its package directory. `None` when nothing matches.
pub fn contents(
    index: &SourceIndex,
    name: &str,
    requirement: &Requirement,
) -> Option<Vec<PathBuf>> {
    let spec = index.find(name, requirement)?;
    let root = spec.full_gem_path()?;
    Some(
        spec.all_files()
            .iter()
            .map(|file| root.join(Path::new(file)))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use gemstone_schema::Version;

    fn installed(root: &Path, name: &str, version: &str) -> Specification {
        let mut spec = Specification::new(name, Version::new(version).unwrap());
        spec.set_summary("test package");
        spec.files = vec!["lib/code.rb".to_string()];

        let spec_dir = root.join("specifications");
        std::fs::create_dir_all(&spec_dir).unwrap();
        let path = spec_dir.join(format!("{}.spec", spec.full_name()));
        std::fs::write(&path, spec.to_descriptor().unwrap()).unwrap();
        spec.loaded_from = Some(path);
        spec
    }

    #[test]
    fn test_from_dirs_loads_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        installed(dir.path(), "a", "1");
        installed(dir.path(), "a", "2");
        installed(dir.path(), "b", "1");
        std::fs::write(dir.path().join("specifications/broken.spec"), "name = ").unwrap();
        std::fs::write(dir.path().join("specifications/notes.txt"), "ignored").unwrap();

        let index = SourceIndex::from_dirs(&[
            dir.path().join("specifications"),
            dir.path().join("missing"),
        ])
        .unwrap();

        assert_eq!(index.len(), 3);
        let found = index.find_by_name("a");
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|s| s.loaded_from.is_some()));
    }

    #[test]
    fn test_search_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = SourceIndex::new();
        for v in ["3", "1", "2"] {
            index.add(installed(dir.path(), "a", v));
        }

        let versions: Vec<String> = index
            .search("a", &Requirement::parse(">= 2").unwrap())
            .iter()
            .map(|s| s.version.to_string())
            .collect();
        assert_eq!(versions, vec!["2", "3"]);
        assert!(index.search("zzz", &Requirement::default()).is_empty());
        assert_eq!(
            index.find("a", &Requirement::default()).map(|s| s.version.to_string()),
            Some("3".to_string())
        );
    }

    #[test]
    fn test_load_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = SourceIndex::new();
        index.add(installed(dir.path(), "a", "1"));
        index.add(installed(dir.path(), "a", "2"));

        let gems = dir.path().join("gems");
        assert_eq!(
            index.all_load_paths(),
            vec![gems.join("a-1/lib"), gems.join("a-2/lib")]
        );
        assert_eq!(index.latest_load_paths(), vec![gems.join("a-2/lib")]);
    }

    #[test]
    fn test_contents() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = SourceIndex::new();
        let mut spec = installed(dir.path(), "a", "2");
        spec.executables = vec!["tool".to_string()];
        index.add(spec);

        let files = contents(&index, "a", &Requirement::default()).unwrap();
        let root = dir.path().join("gems/a-2");
        assert_eq!(files, vec![root.join("bin/tool"), root.join("lib/code.rb")]);

        assert!(contents(&index, "b", &Requirement::default()).is_none());
    }
}
