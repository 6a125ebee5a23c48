//! Package activation.
//!
//! Activating a package selects the highest installed version that matches
//! a requirement and the host's platforms, activates its runtime
//! dependencies first, then appends its require paths to the load path.
//! Each name is activated at most once per engine; later requests either
//! agree with the active version or fail with a conflict.
//!
//! All state lives in [`ActivationEngine`]. Share one across threads with
//! [`SharedEngine`].

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use gemstone_schema::{Dependency, PlatformTag, Requirement, Specification, Version};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::index::SpecSource;

/// Errors raised while activating a package.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActivationError {
    /// No version of the package is installed.
    #[error("could not find {name} ({requirement}) locally")]
    NotFound {
        /// Requested package.
        name: String,
        /// Requested versions.
        requirement: Requirement,
    },

    /// Versions are installed (or already active) but none is acceptable.
    #[error(
        "can't activate {name} ({requirement}), nearest is {}",
        .nearest.as_ref().map_or_else(|| "none".to_string(), ToString::to_string)
    )]
    VersionConflict {
        /// Requested package.
        name: String,
        /// Requested versions.
        requirement: Requirement,
        /// Highest available version, or the active one.
        nearest: Option<Version>,
        /// Every version that was considered, ascending.
        available: Vec<Version>,
    },

    /// The package's autorequire file could not be loaded.
    #[error("failed to load {feature}: {reason}")]
    Load {
        /// Feature that was requested.
        feature: String,
        /// Why loading failed.
        reason: String,
    },
}

/// Resolves `autorequire` features against the load path.
pub trait Loader: Send {
    /// Load `feature`, returning the file that satisfied it.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when nothing on the load path
    /// provides `feature`.
    fn require(&mut self, feature: &str, load_path: &[PathBuf]) -> Result<PathBuf, String>;
}

/// Default [`Loader`]: looks for `<dir>/<feature>` or `<dir>/<feature>.rb`
/// in load-path order and records each file once.
#[derive(Debug, Default)]
pub struct SearchPathLoader {
    loaded: Vec<PathBuf>,
}

/// Extension appended to bare feature names.
const SOURCE_EXTENSION: &str = "rb";

impl SearchPathLoader {
    /// Files loaded so far, in load order.
    pub fn loaded(&self) -> &[PathBuf] {
        &self.loaded
    }
}

impl Loader for SearchPathLoader {
    fn require(&mut self, feature: &str, load_path: &[PathBuf]) -> Result<PathBuf, String> {
        let with_ext = Path::new(feature).with_extension(SOURCE_EXTENSION);
        let found = load_path.iter().find_map(|dir| {
            [dir.join(feature), dir.join(&with_ext)]
                .into_iter()
                .find(|candidate| candidate.is_file())
        });

        let Some(path) = found else {
            return Err(format!("no such file to load -- {feature}"));
        };
        if !self.loaded.contains(&path) {
            debug!("Loaded {}", path.display());
            self.loaded.push(path.clone());
        }
        Ok(path)
    }
}

#[derive(Debug, Clone)]
enum Activation {
    /// Selected, runtime dependencies still being activated.
    Pending(Specification),
    Activated(Specification),
}

impl Activation {
    fn spec(&self) -> &Specification {
        match self {
            Self::Pending(spec) | Self::Activated(spec) => spec,
        }
    }
}

/// Owns the activation state of one process.
pub struct ActivationEngine {
    source: Box<dyn SpecSource + Send>,
    platforms: Vec<PlatformTag>,
    loader: Box<dyn Loader>,
    states: HashMap<String, Activation>,
    load_path: Vec<PathBuf>,
}

/// An engine shared between threads.
pub type SharedEngine = Arc<Mutex<ActivationEngine>>;

impl fmt::Debug for ActivationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationEngine")
            .field("platforms", &self.platforms)
            .field("states", &self.states)
            .field("load_path", &self.load_path)
            .finish_non_exhaustive()
    }
}

impl ActivationEngine {
    /// An engine resolving packages from `source` for hosts supporting
    /// `platforms`.
    pub fn new(source: impl SpecSource + Send + 'static, platforms: Vec<PlatformTag>) -> Self {
        Self {
            source: Box::new(source),
            platforms,
            loader: Box::new(SearchPathLoader::default()),
            states: HashMap::new(),
            load_path: Vec::new(),
        }
    }

    /// Replace the loader used for `autorequire`.
    pub fn with_loader(mut self, loader: impl Loader + 'static) -> Self {
        self.loader = Box::new(loader);
        self
    }

    /// Seed the load path, e.g. with the interpreter's own library dirs.
    pub fn with_load_path(mut self, load_path: Vec<PathBuf>) -> Self {
        self.load_path = load_path;
        self
    }

    /// Wrap the engine for sharing.
    pub fn into_shared(self) -> SharedEngine {
        Arc::new(Mutex::new(self))
    }

    /// Activate `name` at a version satisfying `requirement`.
    ///
    /// Returns `true` if this call activated the package and `false` if a
    /// satisfying version was already active.
    ///
    /// # Errors
    ///
    /// See [`activate_with`](Self::activate_with).
    pub fn activate(
        &mut self,
        name: &str,
        requirement: &Requirement,
    ) -> Result<bool, ActivationError> {
        self.activate_with(name, requirement, false)
    }

    /// Activate `name`, additionally loading its `autorequire` file when
    /// `autorequire` is set. The flag carries over to runtime dependencies,
    /// and an already active package still has its file loaded.
    ///
    /// # Errors
    ///
    /// - [`ActivationError::NotFound`] when nothing named `name` is installed.
    /// - [`ActivationError::VersionConflict`] when no installed version fits
    ///   the requirement and platforms, or a different version is active.
    /// - [`ActivationError::Load`] when the autorequire file is missing.
    ///
    /// A failure in a dependency leaves `name` unactivated; dependencies that
    /// did activate stay active.
    pub fn activate_with(
        &mut self,
        name: &str,
        requirement: &Requirement,
        autorequire: bool,
    ) -> Result<bool, ActivationError> {
        if let Some(state) = self.states.get(name) {
            let active = state.spec();
            if requirement.satisfied_by(&active.version) {
                debug!("{} already active, satisfies {requirement}", active.full_name());
                // a pending package loads its own file once its dependencies are done
                let feature = match state {
                    Activation::Activated(spec) if autorequire => spec.autorequire.clone(),
                    _ => None,
                };
                self.require_feature(feature)?;
                return Ok(false);
            }
            return Err(ActivationError::VersionConflict {
                name: name.to_string(),
                requirement: requirement.clone(),
                nearest: Some(active.version.clone()),
                available: vec![active.version.clone()],
            });
        }

        let mut spec = self.select(name, requirement)?;
        info!("Activating {}", spec.full_name());

        spec.loaded = true;
        self.states
            .insert(name.to_string(), Activation::Pending(spec.clone()));

        let dependencies: Vec<Dependency> = spec.runtime_dependencies().cloned().collect();
        for dependency in &dependencies {
            let result = self.activate_with(&dependency.name, &dependency.requirement, autorequire);
            if let Err(err) = result {
                warn!("Rolling back {}: {err}", spec.full_name());
                self.states.remove(name);
                return Err(err);
            }
        }

        self.extend_load_path(&spec);
        let feature = spec.autorequire.clone().filter(|_| autorequire);
        self.states
            .insert(name.to_string(), Activation::Activated(spec));

        self.require_feature(feature)?;
        Ok(true)
    }

    fn require_feature(&mut self, feature: Option<String>) -> Result<(), ActivationError> {
        let Some(feature) = feature else {
            return Ok(());
        };
        self.loader
            .require(&feature, &self.load_path)
            .map_err(|reason| ActivationError::Load { feature, reason })?;
        Ok(())
    }

    /// Pick the highest installed version matching the requirement and the
    /// engine's platforms.
    fn select(
        &self,
        name: &str,
        requirement: &Requirement,
    ) -> Result<Specification, ActivationError> {
        let installed = self.source.find_by_name(name);
        if installed.is_empty() {
            return Err(ActivationError::NotFound {
                name: name.to_string(),
                requirement: requirement.clone(),
            });
        }

        let best = installed
            .iter()
            .filter(|spec| spec.matches_platforms(&self.platforms))
            .filter(|spec| requirement.satisfied_by(&spec.version))
            .max_by(|a, b| a.version.cmp(&b.version));

        if let Some(spec) = best {
            return Ok(spec.clone());
        }

        let mut available: Vec<Version> = installed.into_iter().map(|spec| spec.version).collect();
        available.sort();
        available.dedup();
        Err(ActivationError::VersionConflict {
            name: name.to_string(),
            requirement: requirement.clone(),
            nearest: available.last().cloned(),
            available,
        })
    }

    fn extend_load_path(&mut self, spec: &Specification) {
        let Some(root) = spec.full_gem_path() else {
            warn!("{} has no install location, load path unchanged", spec.full_name());
            return;
        };

        let bindir = spec.bindir.iter().map(String::as_str);
        for dir in spec.require_paths.iter().map(String::as_str).chain(bindir) {
            let entry = root.join(dir);
            if self.load_path.contains(&entry) {
                continue;
            }
            debug!("Load path += {}", entry.display());
            self.load_path.push(entry);
        }
    }

    /// The load path built so far, in activation order.
    pub fn load_path(&self) -> &[PathBuf] {
        &self.load_path
    }

    /// The activated specification for `name`.
    pub fn activated(&self, name: &str) -> Option<&Specification> {
        match self.states.get(name)? {
            Activation::Activated(spec) => Some(spec),
            Activation::Pending(_) => None,
        }
    }

    /// Whether `name` has been activated.
    pub fn is_activated(&self, name: &str) -> bool {
        self.activated(name).is_some()
    }

    /// Every activated specification, in no particular order.
    pub fn activated_specs(&self) -> impl Iterator<Item = &Specification> {
        self.states.values().filter_map(|state| match state {
            Activation::Activated(spec) => Some(spec),
            Activation::Pending(_) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SourceIndex;
    use gemstone_schema::Platform;

    fn req(s: &str) -> Requirement {
        Requirement::parse(s).unwrap()
    }

    fn spec(root: &Path, name: &str, version: &str) -> Specification {
        let mut spec = Specification::new(name, Version::new(version).unwrap());
        spec.set_summary("test");
        spec.loaded_from = Some(
            root.join("specifications")
                .join(format!("{}.spec", spec.full_name())),
        );
        spec
    }

    fn engine(specs: Vec<Specification>) -> ActivationEngine {
        let mut index = SourceIndex::new();
        for s in specs {
            index.add(s);
        }
        ActivationEngine::new(index, vec![PlatformTag::Generic, PlatformTag::Current])
    }

    #[test]
    fn test_activates_highest_matching() {
        let root = Path::new("/gems");
        let mut engine = engine(vec![
            spec(root, "a", "1"),
            spec(root, "a", "2"),
            spec(root, "a", "3"),
        ]);

        assert!(engine.activate("a", &req("< 3")).unwrap());
        assert_eq!(engine.activated("a").unwrap().version.to_string(), "2");
        assert!(engine.activated("a").unwrap().loaded);
        assert_eq!(engine.load_path(), [PathBuf::from("/gems/gems/a-2/lib")]);
    }

    #[test]
    fn test_double_activation_is_idempotent() {
        let root = Path::new("/gems");
        let mut engine = engine(vec![spec(root, "a", "2")]);

        assert!(engine.activate("a", &Requirement::default()).unwrap());
        assert!(!engine.activate("a", &req(">= 1")).unwrap());
        assert_eq!(engine.load_path().len(), 1);
    }

    #[test]
    fn test_conflict_with_active_version() {
        let root = Path::new("/gems");
        let mut engine = engine(vec![spec(root, "a", "1"), spec(root, "a", "2")]);

        engine.activate("a", &req("= 1")).unwrap();
        let err = engine.activate("a", &req("= 2")).unwrap_err();
        match err {
            ActivationError::VersionConflict { nearest, .. } => {
                assert_eq!(nearest, Some(Version::new("1").unwrap()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_not_found_and_no_match() {
        let root = Path::new("/gems");
        let mut engine = engine(vec![spec(root, "a", "1"), spec(root, "a", "1.5")]);

        assert!(matches!(
            engine.activate("zzz", &Requirement::default()),
            Err(ActivationError::NotFound { .. })
        ));

        let err = engine.activate("a", &req("> 2")).unwrap_err();
        let ActivationError::VersionConflict { nearest, available, .. } = err else {
            panic!("expected conflict");
        };
        assert_eq!(nearest, Some(Version::new("1.5").unwrap()));
        assert_eq!(available.len(), 2);
        assert!(engine.load_path().is_empty());
    }

    #[test]
    fn test_dependencies_activate_first() {
        let root = Path::new("/gems");
        let mut a = spec(root, "a", "2");
        a.add_dependency("b", req(">= 1"));
        a.add_development_dependency("c", Requirement::default());

        let mut engine = engine(vec![a, spec(root, "b", "1")]);
        engine.activate("a", &Requirement::default()).unwrap();

        assert_eq!(
            engine.load_path(),
            [
                PathBuf::from("/gems/gems/b-1/lib"),
                PathBuf::from("/gems/gems/a-2/lib"),
            ]
        );
        assert!(engine.is_activated("b"));
        assert!(!engine.is_activated("c"));
    }

    #[test]
    fn test_dependency_failure_rolls_back_parent() {
        let root = Path::new("/gems");
        let mut a = spec(root, "a", "2");
        a.add_dependency("b", req(">= 1"));
        a.add_dependency("missing", Requirement::default());

        let mut engine = engine(vec![a, spec(root, "b", "1")]);
        let err = engine.activate("a", &Requirement::default()).unwrap_err();

        assert!(matches!(err, ActivationError::NotFound { ref name, .. } if name == "missing"));
        assert!(!engine.is_activated("a"));
        assert!(engine.is_activated("b"));
        assert_eq!(engine.load_path(), [PathBuf::from("/gems/gems/b-1/lib")]);
    }

    #[test]
    fn test_dependency_cycle_terminates() {
        let root = Path::new("/gems");
        let mut a = spec(root, "a", "1");
        a.add_dependency("b", Requirement::default());
        let mut b = spec(root, "b", "1");
        b.add_dependency("a", Requirement::default());

        let mut engine = engine(vec![a, b]);
        assert!(engine.activate("a", &Requirement::default()).unwrap());
        assert!(engine.is_activated("a"));
        assert!(engine.is_activated("b"));
    }

    #[test]
    fn test_platform_filter() {
        let root = Path::new("/gems");
        let mut native = spec(root, "a", "2");
        native.platform = PlatformTag::Native(Platform::from_parts(Some("sparc"), "plan9", None));

        let mut engine = engine(vec![spec(root, "a", "1"), native]);
        engine.activate("a", &Requirement::default()).unwrap();
        assert_eq!(engine.activated("a").unwrap().version.to_string(), "1");
    }

    #[test]
    fn test_bindir_added_after_require_paths() {
        let root = Path::new("/gems");
        let mut a = spec(root, "a", "1");
        a.require_paths = vec!["lib".to_string(), "ext".to_string()];
        a.bindir = Some("bin".to_string());

        let mut engine = engine(vec![a]);
        engine.activate("a", &Requirement::default()).unwrap();
        let expected: Vec<PathBuf> = ["lib", "ext", "bin"]
            .iter()
            .map(|d| PathBuf::from("/gems/gems/a-1").join(d))
            .collect();
        assert_eq!(engine.load_path(), expected.as_slice());
    }

    #[test]
    fn test_autorequire() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = spec(dir.path(), "a", "1");
        a.autorequire = Some("a".to_string());
        let lib = dir.path().join("gems/a-1/lib");
        std::fs::create_dir_all(&lib).unwrap();
        std::fs::write(lib.join("a.rb"), "").unwrap();

        let mut missing = spec(dir.path(), "m", "1");
        missing.autorequire = Some("nothing_here".to_string());

        let mut engine = engine(vec![a, missing]);
        assert!(engine.activate_with("a", &Requirement::default(), true).unwrap());

        let err = engine
            .activate_with("m", &Requirement::default(), true)
            .unwrap_err();
        assert!(matches!(err, ActivationError::Load { .. }));
    }

    /// Records requested features without touching the filesystem.
    #[derive(Clone, Default)]
    struct RecordingLoader(Arc<Mutex<Vec<String>>>);

    impl Loader for RecordingLoader {
        fn require(&mut self, feature: &str, _: &[PathBuf]) -> Result<PathBuf, String> {
            self.0.lock().unwrap().push(feature.to_string());
            Ok(PathBuf::from(feature))
        }
    }

    #[test]
    fn test_autorequire_reaches_dependencies() {
        let root = Path::new("/gems");
        let mut a = spec(root, "a", "1");
        a.autorequire = Some("a".to_string());
        a.add_dependency("b", Requirement::default());
        let mut b = spec(root, "b", "1");
        b.autorequire = Some("b".to_string());

        let loader = RecordingLoader::default();
        let mut engine = engine(vec![a, b]).with_loader(loader.clone());
        engine.activate_with("a", &Requirement::default(), true).unwrap();

        assert_eq!(*loader.0.lock().unwrap(), ["b", "a"]);
    }

    #[test]
    fn test_autorequire_on_already_active_package() {
        let root = Path::new("/gems");
        let mut a = spec(root, "a", "1");
        a.autorequire = Some("a".to_string());

        let loader = RecordingLoader::default();
        let mut engine = engine(vec![a]).with_loader(loader.clone());
        assert!(engine.activate("a", &Requirement::default()).unwrap());
        assert!(loader.0.lock().unwrap().is_empty());

        assert!(!engine.activate_with("a", &req(">= 1"), true).unwrap());
        assert_eq!(*loader.0.lock().unwrap(), ["a"]);
    }

    #[test]
    fn test_autorequire_with_cycle_loads_each_once() {
        let root = Path::new("/gems");
        let mut a = spec(root, "a", "1");
        a.autorequire = Some("a".to_string());
        a.add_dependency("b", Requirement::default());
        let mut b = spec(root, "b", "1");
        b.autorequire = Some("b".to_string());
        b.add_dependency("a", Requirement::default());

        let loader = RecordingLoader::default();
        let mut engine = engine(vec![a, b]).with_loader(loader.clone());
        engine.activate_with("a", &Requirement::default(), true).unwrap();

        assert_eq!(*loader.0.lock().unwrap(), ["b", "a"]);
    }

    #[test]
    fn test_shared_engine() {
        let root = Path::new("/gems");
        let shared = engine(vec![spec(root, "a", "1")]).into_shared();

        let handle = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                shared
                    .lock()
                    .unwrap()
                    .activate("a", &Requirement::default())
                    .unwrap()
            })
        };
        assert!(handle.join().unwrap());
        assert!(shared.lock().unwrap().is_activated("a"));
    }
}
