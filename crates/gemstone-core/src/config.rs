//! Runtime configuration and install-root layout.
//!
//! The install root ("home") is `$GEMSTONE_HOME` when set, otherwise
//! `~/.gemstone`. An optional `<home>/config.toml` overrides the defaults
//! below; every key is optional.

use std::path::{Path, PathBuf};

use gemstone_schema::{DESCRIPTOR_EXTENSION, PlatformTag, Specification, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable overriding the install root.
pub const HOME_ENV: &str = "GEMSTONE_HOME";

/// Name of the per-root configuration file.
pub const CONFIG_FILE: &str = "config.toml";

const DEFAULT_INTERPRETER: &str = "ruby";
const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 600;

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Neither `GEMSTONE_HOME` nor a home directory is available.
    #[error("could not determine home directory; set {HOME_ENV} to override")]
    NoHome,

    /// The config file exists but could not be read.
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        /// Config file path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The config file is not valid.
    #[error("invalid config {}: {source}", .path.display())]
    Parse {
        /// Config file path.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
}

/// Resolved configuration for one process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Install root. Never read from the config file.
    #[serde(skip)]
    pub home: PathBuf,
    /// Extra install roots searched for installed packages.
    pub path: Vec<PathBuf>,
    /// Where executables are installed. Defaults to `<home>/bin`.
    pub bin_dir: Option<PathBuf>,
    /// Interpreter used in launcher shebangs and extension builds.
    pub interpreter: PathBuf,
    /// Bare interpreter name, used for `#!/usr/bin/env` shebangs.
    pub interpreter_name: String,
    /// Version of the interpreter, checked against
    /// `required_runtime_version`. Unset skips the check.
    pub runtime_version: Option<Version>,
    /// Platforms this host can run, in preference order.
    pub platforms: Vec<PlatformTag>,
    /// Install launcher scripts (true) or symlinks (false).
    pub wrappers: bool,
    /// Emit `#!/usr/bin/env <interpreter_name>` shebangs.
    pub env_shebang: bool,
    /// Apply [`exec_format`](Self::exec_format) to installed executables.
    pub format_executable: bool,
    /// Executable name template; `%s` is replaced by the name.
    pub exec_format: String,
    /// Upper bound for each extension build step.
    pub build_timeout_secs: u64,
    /// Build native extensions during install.
    pub build_extensions: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home: PathBuf::new(),
            path: Vec::new(),
            bin_dir: None,
            interpreter: which::which(DEFAULT_INTERPRETER)
                .unwrap_or_else(|_| PathBuf::from("/usr/bin").join(DEFAULT_INTERPRETER)),
            interpreter_name: DEFAULT_INTERPRETER.to_string(),
            runtime_version: None,
            platforms: vec![PlatformTag::Generic, PlatformTag::Current],
            wrappers: true,
            env_shebang: false,
            format_executable: false,
            exec_format: "%s".to_string(),
            build_timeout_secs: DEFAULT_BUILD_TIMEOUT_SECS,
            build_extensions: true,
        }
    }
}

/// Returns the install root, or None if the user's home cannot be resolved.
pub fn try_gemstone_home() -> Option<PathBuf> {
    if let Ok(val) = std::env::var(HOME_ENV) {
        return Some(PathBuf::from(val));
    }
    dirs::home_dir().map(|h| h.join(".gemstone"))
}

impl Config {
    /// Resolve the install root and load its config file.
    ///
    /// # Errors
    ///
    /// Fails when no home can be determined or the config file is invalid.
    pub fn load() -> Result<Self, ConfigError> {
        let home = try_gemstone_home().ok_or(ConfigError::NoHome)?;
        Self::load_from(home)
    }

    /// Load configuration for an explicit install root. A missing config
    /// file yields the defaults.
    ///
    /// # Errors
    ///
    /// Fails when the config file exists but cannot be read or parsed.
    pub fn load_from(home: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let home = home.into();
        let path = home.join(CONFIG_FILE);

        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            toml::from_str::<Self>(&text).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?
        } else {
            Self::default()
        };

        tracing::debug!("Using install root {}", home.display());
        config.home = home;
        Ok(config)
    }

    /// Defaults for `home`, ignoring any config file.
    pub fn for_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            ..Self::default()
        }
    }

    /// Unpacked packages: `<home>/gems`
    pub fn gems_dir(&self) -> PathBuf {
        self.home.join("gems")
    }

    /// Installed descriptors: `<home>/specifications`
    pub fn specifications_dir(&self) -> PathBuf {
        self.home.join("specifications")
    }

    /// Executable target: `bin_dir` or `<home>/bin`
    pub fn bin_path(&self) -> PathBuf {
        self.bin_dir.clone().unwrap_or_else(|| self.home.join("bin"))
    }

    /// Copies of installed archives: `<home>/cache`
    pub fn cache_dir(&self) -> PathBuf {
        self.home.join("cache")
    }

    /// Install-root lock file: `<home>/.lock`
    pub fn lock_path(&self) -> PathBuf {
        self.home.join(".lock")
    }

    /// Descriptor directories of the install root and every extra root.
    pub fn spec_dirs(&self) -> Vec<PathBuf> {
        std::iter::once(self.home.as_path())
            .chain(self.path.iter().map(PathBuf::as_path))
            .map(|root| root.join("specifications"))
            .collect()
    }

    /// Descriptor path for `spec` under this root.
    pub fn spec_file(&self, spec: &Specification) -> PathBuf {
        spec_file_in(&self.home, spec)
    }

    /// Installed name of executable `name`, honouring `format_executable`.
    pub fn formatted_program_filename(&self, name: &str) -> String {
        if self.format_executable {
            self.exec_format.replace("%s", name)
        } else {
            name.to_string()
        }
    }

    /// Per-step timeout for extension builds.
    pub fn build_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.build_timeout_secs)
    }
}

/// `<root>/specifications/<full_name>.spec`
pub fn spec_file_in(root: &Path, spec: &Specification) -> PathBuf {
    root.join("specifications")
        .join(format!("{}.{DESCRIPTOR_EXTENSION}", spec.full_name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let config = Config::for_home("/opt/gemstone");
        assert_eq!(config.gems_dir(), PathBuf::from("/opt/gemstone/gems"));
        assert_eq!(
            config.specifications_dir(),
            PathBuf::from("/opt/gemstone/specifications")
        );
        assert_eq!(config.bin_path(), PathBuf::from("/opt/gemstone/bin"));
        assert_eq!(config.cache_dir(), PathBuf::from("/opt/gemstone/cache"));

        let spec = Specification::new("a", Version::new("2").unwrap());
        assert_eq!(
            config.spec_file(&spec),
            PathBuf::from("/opt/gemstone/specifications/a-2.spec")
        );
    }

    #[test]
    fn test_load_from_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(dir.path()).unwrap();

        assert_eq!(config.home, dir.path());
        assert!(config.wrappers);
        assert_eq!(config.platforms, vec![PlatformTag::Generic, PlatformTag::Current]);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"
wrappers = false
bin_dir = "/usr/local/bin"
runtime_version = "1.8.6"
platforms = ["ruby", "x86-linux"]
format_executable = true
exec_format = "%s18"
"#,
        )
        .unwrap();

        let config = Config::load_from(dir.path()).unwrap();
        assert!(!config.wrappers);
        assert_eq!(config.bin_path(), PathBuf::from("/usr/local/bin"));
        assert_eq!(config.runtime_version, Some(Version::new("1.8.6").unwrap()));
        assert_eq!(config.platforms[1].to_string(), "x86-linux");
        assert_eq!(config.formatted_program_filename("rake"), "rake18");
    }

    #[test]
    fn test_load_rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "colour = true\n").unwrap();

        let err = Config::load_from(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_spec_dirs_include_extra_roots() {
        let mut config = Config::for_home("/a");
        config.path.push(PathBuf::from("/b"));
        assert_eq!(
            config.spec_dirs(),
            vec![PathBuf::from("/a/specifications"), PathBuf::from("/b/specifications")]
        );
    }
}
