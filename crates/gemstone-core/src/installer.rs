//! Package installation.
//!
//! [`Installer::install`] runs a fixed pipeline over an [`Archive`]:
//!
//! 1. compatibility (runtime version, package-manager version, platform),
//!    skipped with `force`;
//! 2. runtime dependencies, skipped with `ignore_dependencies`;
//! 3. destination `<root>/gems/<full_name>`;
//! 4. extraction, refusing any path that would land outside the
//!    destination;
//! 5. descriptor written to `<root>/specifications/<full_name>.spec`;
//! 6. native extensions;
//! 7. executables, as launcher scripts or symlinks.
//!
//! Each stage fails the whole install. Nothing is rolled back.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use gemstone_schema::{
    Dependency, GEMSTONE_VERSION, Specification, SpecificationError, Version,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::archive::Archive;
use crate::config::{Config, spec_file_in};
use crate::ext::{BuildContext, BuilderRegistry, ExtensionBuildError};
use crate::index::SpecSource;
use crate::reporter::{NullReporter, Reporter};

/// Errors raised by the install pipeline.
#[derive(Error, Debug)]
pub enum InstallError {
    /// The package does not run on this interpreter, package manager or
    /// platform.
    #[error("{0}")]
    Incompatible(String),

    /// A runtime dependency is not installed.
    #[error("{0}")]
    UnmetDependency(String),

    /// An archive entry would be written outside the package directory.
    #[error("{0}")]
    UnsafePath(String),

    /// The package file could not be read.
    #[error("{0}")]
    Format(String),

    /// A native extension failed to build.
    #[error(transparent)]
    ExtensionBuild(#[from] ExtensionBuildError),

    /// A target directory is not writable.
    #[error(transparent)]
    FilePermission(#[from] FilePermissionError),

    /// The descriptor could not be written.
    #[error(transparent)]
    Specification(#[from] SpecificationError),

    /// Any other filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A directory needed by the installer could not be created or written.
#[derive(Error, Debug)]
#[error("You don't have write permissions into the {} directory.", .path.display())]
pub struct FilePermissionError {
    /// Directory or file that could not be written.
    pub path: PathBuf,
    /// Underlying error.
    #[source]
    pub source: io::Error,
}

impl FilePermissionError {
    fn at(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Per-install switches.
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Skip the compatibility checks.
    pub force: bool,
    /// Skip the dependency check.
    pub ignore_dependencies: bool,
    /// Install into this root instead of the configured home.
    pub install_root: Option<PathBuf>,
}

/// Installs one package archive.
pub struct Installer<'a> {
    archive: &'a dyn Archive,
    config: &'a Config,
    options: InstallOptions,
    reporter: &'a dyn Reporter,
    registry: BuilderRegistry,
}

impl fmt::Debug for Installer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Installer")
            .field("package", &self.archive.specification().full_name())
            .field("options", &self.options)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl<'a> Installer<'a> {
    /// An installer for `archive` using `config` and default options.
    pub fn new(archive: &'a dyn Archive, config: &'a Config) -> Self {
        Self {
            archive,
            config,
            options: InstallOptions::default(),
            reporter: &NullReporter,
            registry: BuilderRegistry::default(),
        }
    }

    /// Replace the install options.
    pub fn with_options(mut self, options: InstallOptions) -> Self {
        self.options = options;
        self
    }

    /// Report progress and messages to `reporter`.
    pub fn with_reporter(mut self, reporter: &'a dyn Reporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Use a custom extension builder registry.
    pub fn with_registry(mut self, registry: BuilderRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// The absolute, normalized install root.
    ///
    /// # Errors
    ///
    /// Returns [`FilePermissionError`] if the root cannot be made absolute.
    pub fn install_root(&self) -> Result<PathBuf, InstallError> {
        let root = self
            .options
            .install_root
            .as_deref()
            .unwrap_or(&self.config.home);
        let absolute = std::path::absolute(root).map_err(FilePermissionError::at(root))?;
        Ok(normalize(&absolute))
    }

    /// `<root>/gems/<full_name>` for the package being installed.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::UnsafePath`] when the full name is not a
    /// single path component, otherwise see
    /// [`install_root`](Self::install_root).
    pub fn gem_dir(&self) -> Result<PathBuf, InstallError> {
        let full_name = self.archive.specification().full_name();
        let gems = self.install_root()?.join("gems");
        direct_child(&gems, &full_name).ok_or_else(|| {
            InstallError::UnsafePath(format!(
                "attempt to install package \"{full_name}\" outside \"{}\"",
                gems.display()
            ))
        })
    }

    /// Run the full install pipeline and return the installed
    /// specification, with `loaded_from` pointing at its descriptor.
    ///
    /// # Errors
    ///
    /// Fails at the first stage that fails; see [`InstallError`].
    pub fn install(&self, source: &dyn SpecSource) -> Result<Specification, InstallError> {
        let mut spec = self.archive.specification().clone();
        self.reporter.installing(&spec.name, &spec.version);

        if self.options.force {
            debug!("Skipping compatibility checks for {}", spec.full_name());
        } else {
            self.check_compatibility(&spec)?;
        }

        if !self.options.ignore_dependencies {
            for dependency in spec.runtime_dependencies() {
                self.ensure_dependency(&spec, dependency, source)?;
            }
        }

        let root = self.install_root()?;
        let gem_dir = self.gem_dir()?;
        let bin_dir = match &self.options.install_root {
            Some(custom) if self.config.bin_dir.is_none() => custom.join("bin"),
            _ => self.config.bin_path(),
        };
        let launchers = self.resolve_executables(&spec, &gem_dir, &bin_dir)?;

        fs::create_dir_all(&gem_dir).map_err(FilePermissionError::at(&gem_dir))?;
        info!("Installing {} into {}", spec.full_name(), gem_dir.display());

        self.extract_files(&gem_dir)?;
        self.write_spec(&root, &mut spec)?;
        self.cache_archive(&root)?;
        self.build_extensions(&spec, &gem_dir)?;
        self.generate_bin(&spec, &bin_dir, launchers)?;

        if let Some(message) = &spec.post_install_message {
            self.reporter.info(message);
        }
        self.reporter.done(&spec.name, &spec.version, "installed");
        Ok(spec)
    }

    /// Extract the payload into `dest` without any other install stage.
    ///
    /// # Errors
    ///
    /// Fails on unsafe entry paths or filesystem errors.
    pub fn unpack(&self, dest: &Path) -> Result<(), InstallError> {
        let dest = normalize(&std::path::absolute(dest)?);
        fs::create_dir_all(&dest).map_err(FilePermissionError::at(&dest))?;
        self.extract_files(&dest)
    }

    /// Check that the package supports this interpreter, package manager and
    /// platform.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::Incompatible`] naming the failed check.
    pub fn check_compatibility(&self, spec: &Specification) -> Result<(), InstallError> {
        if let Some(required) = &spec.required_runtime_version {
            match &self.config.runtime_version {
                Some(runtime) if !required.satisfied_by(runtime) => {
                    return Err(InstallError::Incompatible(format!(
                        "{} requires runtime version {required}",
                        spec.name
                    )));
                }
                Some(_) => {}
                None => warn!(
                    "Runtime version unknown, not checking {} ({required})",
                    spec.name
                ),
            }
        }

        if let Some(required) = &spec.required_package_manager_version {
            let current = Version::new(GEMSTONE_VERSION)
                .unwrap_or_else(|_| Version::from_segments(vec![0]));
            if !required.satisfied_by(&current) {
                return Err(InstallError::Incompatible(format!(
                    "{} requires gemstone version {required}",
                    spec.name
                )));
            }
        }

        if !spec.matches_platforms(&self.config.platforms) {
            return Err(InstallError::Incompatible(format!(
                "{} is not compatible with this platform",
                spec.full_name()
            )));
        }

        Ok(())
    }

    /// Whether some installed package satisfies `dependency`.
    pub fn installation_satisfies_dependency(
        &self,
        dependency: &Dependency,
        source: &dyn SpecSource,
    ) -> bool {
        source
            .find_by_name(&dependency.name)
            .iter()
            .any(|installed| installed.satisfies_requirement(dependency))
    }

    /// Fail unless `dependency` of `spec` is installed.
    ///
    /// # Errors
    ///
    /// Returns [`InstallError::UnmetDependency`], e.g.
    /// `a requires b (> 2, runtime)`.
    pub fn ensure_dependency(
        &self,
        spec: &Specification,
        dependency: &Dependency,
        source: &dyn SpecSource,
    ) -> Result<(), InstallError> {
        if self.installation_satisfies_dependency(dependency, source) {
            return Ok(());
        }
        Err(InstallError::UnmetDependency(format!(
            "{} requires {dependency}",
            spec.name
        )))
    }

    fn extract_files(&self, gem_dir: &Path) -> Result<(), InstallError> {
        for entry in self.archive.file_entries() {
            let target = safe_destination(gem_dir, &entry.path)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, &entry.data)?;
            set_mode(&target, entry.mode)?;
        }
        debug!(
            "Extracted {} files into {}",
            self.archive.file_entries().len(),
            gem_dir.display()
        );
        Ok(())
    }

    fn write_spec(
        &self,
        root: &Path,
        spec: &mut Specification,
    ) -> Result<PathBuf, InstallError> {
        let path = spec_file_in(root, spec);
        let dir = root.join("specifications");
        if normalize(&path).parent() != Some(dir.as_path()) {
            return Err(InstallError::UnsafePath(format!(
                "attempt to write specification \"{}\" outside \"{}\"",
                path.display(),
                dir.display()
            )));
        }
        fs::create_dir_all(&dir).map_err(FilePermissionError::at(&dir))?;
        fs::write(&path, spec.to_descriptor()?)?;
        debug!("Wrote {}", path.display());
        spec.loaded_from = Some(path.clone());
        Ok(path)
    }

    fn cache_archive(&self, root: &Path) -> Result<(), InstallError> {
        let Some(source) = self.archive.source_path() else {
            return Ok(());
        };
        let Some(file_name) = source.file_name() else {
            return Ok(());
        };

        let cache_dir = root.join("cache");
        let cached = cache_dir.join(file_name);
        let absolute = std::path::absolute(source).map(|s| normalize(&s)).ok();
        if absolute.as_deref() == Some(cached.as_path()) {
            return Ok(());
        }
        fs::create_dir_all(&cache_dir).map_err(FilePermissionError::at(&cache_dir))?;
        fs::copy(source, &cached)?;
        Ok(())
    }

    fn build_extensions(&self, spec: &Specification, gem_dir: &Path) -> Result<(), InstallError> {
        if spec.extensions.is_empty() {
            return Ok(());
        }
        if !self.config.build_extensions {
            self.reporter
                .warning(&format!("Skipping native extensions for {}", spec.full_name()));
            return Ok(());
        }

        self.reporter
            .info("Building native extensions.  This could take a while...");
        let dest = gem_dir.join(spec.require_paths.first().map_or("lib", String::as_str));
        let ctx = BuildContext {
            interpreter: self.config.interpreter.clone(),
            gem_dir: gem_dir.to_path_buf(),
            dest,
            timeout: self.config.build_timeout(),
        };

        for extension in &spec.extensions {
            self.registry.build(extension, &ctx)?;
        }
        Ok(())
    }

    /// Pair each executable with its source under `gem_dir` and its
    /// launcher path under `bin_dir`.
    fn resolve_executables(
        &self,
        spec: &Specification,
        gem_dir: &Path,
        bin_dir: &Path,
    ) -> Result<Vec<Launcher>, InstallError> {
        let unsafe_exe = |exe: &str| {
            InstallError::UnsafePath(format!(
                "attempt to install executable \"{exe}\" from {}",
                spec.full_name()
            ))
        };

        let source_dir = gem_dir.join(spec.bindir());
        let mut launchers = Vec::with_capacity(spec.executables.len());
        for exe in &spec.executables {
            let exe_path = direct_child(&source_dir, exe)
                .filter(|path| normalize(path).starts_with(gem_dir))
                .ok_or_else(|| unsafe_exe(exe.as_str()))?;
            let target = direct_child(bin_dir, &self.config.formatted_program_filename(exe))
                .ok_or_else(|| unsafe_exe(exe.as_str()))?;
            launchers.push((exe.clone(), exe_path, target));
        }
        Ok(launchers)
    }

    fn generate_bin(
        &self,
        spec: &Specification,
        bin_dir: &Path,
        launchers: Vec<Launcher>,
    ) -> Result<(), InstallError> {
        if launchers.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(bin_dir).map_err(FilePermissionError::at(bin_dir))?;

        for (exe, exe_path, target) in launchers {
            if !exe_path.is_file() {
                warn!("{} does not exist, skipping executable {exe}", exe_path.display());
                continue;
            }
            make_executable(&exe_path)?;

            if self.config.wrappers {
                self.generate_wrapper(spec, &exe, &exe_path, &target)?;
            } else {
                self.generate_symlink(spec, &exe, &exe_path, &target)?;
            }
        }
        Ok(())
    }

    fn generate_wrapper(
        &self,
        spec: &Specification,
        exe: &str,
        exe_path: &Path,
        target: &Path,
    ) -> Result<(), InstallError> {
        // never write through a link left by a symlink-mode install
        if target.symlink_metadata().is_ok() {
            fs::remove_file(target).map_err(FilePermissionError::at(target))?;
        }

        let text = self.app_script_text(spec, exe, &self.shebang(exe_path));
        fs::write(target, text).map_err(FilePermissionError::at(target))?;
        set_mode(target, 0o755).map_err(FilePermissionError::at(target))?;
        debug!("Installed wrapper {}", target.display());
        Ok(())
    }

    #[cfg(unix)]
    fn generate_symlink(
        &self,
        spec: &Specification,
        _exe: &str,
        exe_path: &Path,
        target: &Path,
    ) -> Result<(), InstallError> {
        if let Ok(meta) = target.symlink_metadata() {
            if meta.file_type().is_symlink() {
                let linked = fs::read_link(target)
                    .ok()
                    .and_then(|link| linked_version(&link, &spec.name));
                if let Some(existing) = linked {
                    if spec.version <= existing {
                        info!(
                            "Keeping {} linked to {} {existing}",
                            target.display(),
                            spec.name
                        );
                        return Ok(());
                    }
                }
            }
            fs::remove_file(target).map_err(FilePermissionError::at(target))?;
        }

        std::os::unix::fs::symlink(exe_path, target).map_err(FilePermissionError::at(target))?;
        debug!("Linked {} -> {}", target.display(), exe_path.display());
        Ok(())
    }

    #[cfg(not(unix))]
    fn generate_symlink(
        &self,
        spec: &Specification,
        exe: &str,
        exe_path: &Path,
        target: &Path,
    ) -> Result<(), InstallError> {
        self.reporter
            .warning("Unable to use symlinks on this platform, installing wrapper");
        self.generate_wrapper(spec, exe, exe_path, target)
    }

    /// Shebang line for a launcher of the executable at `exe_path`.
    ///
    /// The configured interpreter replaces whatever the executable names,
    /// including `#!/usr/bin/env <name>` forms, and trailing flags are kept.
    pub fn shebang(&self, exe_path: &Path) -> String {
        if self.config.env_shebang {
            return format!("#!/usr/bin/env {}", self.config.interpreter_name);
        }

        let interpreter = self.config.interpreter.display();
        let first_line = fs::read(exe_path)
            .map(|bytes| {
                let line = bytes.split(|b| *b == b'\n').next().unwrap_or_default();
                String::from_utf8_lossy(line).into_owned()
            })
            .unwrap_or_default();

        let Some(command) = first_line.trim_end().strip_prefix("#!") else {
            return format!("#!{interpreter}");
        };

        let mut words = command.split_whitespace();
        let program = words.next().unwrap_or_default();
        if Path::new(program).file_name().is_some_and(|name| name == "env") {
            words.next();
        }

        let flags: Vec<&str> = words.collect();
        if flags.is_empty() {
            format!("#!{interpreter}")
        } else {
            format!("#!{interpreter} {}", flags.join(" "))
        }
    }

    /// Launcher script text for executable `exe`, pinned to this version.
    pub fn app_script_text(&self, spec: &Specification, exe: &str, shebang: &str) -> String {
        format!(
            r#"{shebang}
#
# This file was generated by gemstone.
#
# The application '{name}' is installed as part of a package, and
# this file is here to facilitate running it.
#

require 'gemstone'

version = "= {version}"

if ARGV.first =~ /^_(.*)_$/ and Gemstone::Version.correct? $1 then
  version = $1
  ARGV.shift
end

gem '{name}', version
load '{exe}'
"#,
            name = spec.name,
            version = spec.version,
        )
    }
}

/// Resolve `relative` under `gem_dir`, rejecting absolute or escaping paths.
fn safe_destination(gem_dir: &Path, relative: &Path) -> Result<PathBuf, InstallError> {
    if relative.has_root() || relative.is_absolute() {
        return Err(InstallError::UnsafePath(format!(
            "attempt to install file into \"{}\"",
            relative.display()
        )));
    }

    let target = normalize(&gem_dir.join(relative));
    if target == gem_dir || !target.starts_with(gem_dir) {
        return Err(InstallError::UnsafePath(format!(
            "attempt to install file into \"{}\" under \"{}\"",
            relative.display(),
            gem_dir.display()
        )));
    }
    Ok(target)
}

/// Executable name, its file in the package and its launcher path.
type Launcher = (String, PathBuf, PathBuf);

/// `dir/name` when `name` is exactly one plain path component.
fn direct_child(dir: &Path, name: &str) -> Option<PathBuf> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part == name => Some(dir.join(part)),
        _ => None,
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Version of `name` a launcher link points at, read from the
/// `gems/<name>-<version>[-platform]` component of its target.
fn linked_version(link: &Path, name: &str) -> Option<Version> {
    let parts: Vec<String> = link
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let prefix = format!("{name}-");

    parts.windows(2).find_map(|pair| {
        let rest = pair[1].strip_prefix(&prefix).filter(|_| pair[0] == "gems")?;
        Version::new(rest.split('-').next()?).ok()
    })
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(path)?.permissions().mode();
    set_mode(path, mode | 0o111)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}
