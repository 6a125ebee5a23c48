//! Native extension builds.
//!
//! Each extension listed by a package is a build file (`extconf.rb`,
//! `configure`, `Rakefile`, `mkrf_conf*`, or a `*.sh` script). The
//! [`BuilderRegistry`] picks an [`ExtensionBuilder`] by file name and runs
//! its steps in the extension's directory. Every command line and all of its
//! output is appended to `<gem_dir>/gem_make.out`.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Build log written into the package directory.
pub const BUILD_LOG: &str = "gem_make.out";

/// A native extension failed to build. Details are in the build log.
#[derive(Error, Debug)]
#[error("Failed to build native extension.")]
pub struct ExtensionBuildError {
    /// Extension that failed.
    pub extension: String,
    /// Build log holding the command output.
    pub log: PathBuf,
}

/// Inputs shared by every build step.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Interpreter used to run build scripts.
    pub interpreter: PathBuf,
    /// Root of the unpacked package.
    pub gem_dir: PathBuf,
    /// Where built artifacts are installed (the first require path).
    pub dest: PathBuf,
    /// Upper bound for each step.
    pub timeout: Duration,
}

/// One command of a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStep {
    /// Program to run.
    pub program: PathBuf,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment.
    pub env: Vec<(String, String)>,
}

impl BuildStep {
    fn new(program: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            env: Vec::new(),
        }
    }

    fn arg(mut self, arg: String) -> Self {
        self.args.push(arg);
        self
    }

    fn env(mut self, key: &str, value: String) -> Self {
        self.env.push((key.to_string(), value));
        self
    }
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Turns one kind of build file into commands.
pub trait ExtensionBuilder: Send + Sync + fmt::Debug {
    /// Whether this builder handles a build file named `file_name`.
    fn handles(&self, file_name: &str) -> bool;

    /// Commands to run, in order, from the build file's directory.
    fn steps(&self, build_file: &Path, ctx: &BuildContext) -> Vec<BuildStep>;
}

fn install_dirs(ctx: &BuildContext) -> [String; 2] {
    let dest = ctx.dest.display();
    [format!("RUBYARCHDIR={dest}"), format!("RUBYLIBDIR={dest}")]
}

fn make_steps(ctx: &BuildContext, extra: &[String]) -> Vec<BuildStep> {
    let make = || {
        extra
            .iter()
            .fold(BuildStep::new("make", &[]), |step, a| step.arg(a.clone()))
    };
    vec![make(), make().arg("install".to_string())]
        .into_iter()
        .map(|step| {
            step.env("DESTDIR", String::new())
                .env("PREFIX", ctx.dest.display().to_string())
        })
        .collect()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `extconf.rb`: generate a Makefile with the interpreter, then make.
#[derive(Debug, Clone, Copy)]
pub struct ExtConfBuilder;

impl ExtensionBuilder for ExtConfBuilder {
    fn handles(&self, file_name: &str) -> bool {
        file_name == "extconf.rb"
    }

    fn steps(&self, build_file: &Path, ctx: &BuildContext) -> Vec<BuildStep> {
        let mut steps = vec![BuildStep::new(&ctx.interpreter, &[&file_name(build_file)])];
        steps.extend(make_steps(ctx, &install_dirs(ctx)));
        steps
    }
}

/// `configure`: autoconf-style script, then make.
#[derive(Debug, Clone, Copy)]
pub struct ConfigureBuilder;

impl ExtensionBuilder for ConfigureBuilder {
    fn handles(&self, file_name: &str) -> bool {
        file_name == "configure"
    }

    fn steps(&self, build_file: &Path, ctx: &BuildContext) -> Vec<BuildStep> {
        let configure = BuildStep::new("sh", &[&format!("./{}", file_name(build_file))])
            .arg(format!("--prefix={}", ctx.gem_dir.display()));
        let mut steps = vec![configure];
        steps.extend(make_steps(ctx, &[]));
        steps
    }
}

/// `Rakefile` and `mkrf_conf*`: optional configuration script, then rake.
#[derive(Debug, Clone, Copy)]
pub struct RakeBuilder;

impl ExtensionBuilder for RakeBuilder {
    fn handles(&self, file_name: &str) -> bool {
        file_name == "Rakefile" || file_name.starts_with("mkrf_conf")
    }

    fn steps(&self, build_file: &Path, ctx: &BuildContext) -> Vec<BuildStep> {
        let name = file_name(build_file);
        let mut steps = Vec::new();
        if name.starts_with("mkrf_conf") {
            steps.push(BuildStep::new(&ctx.interpreter, &[&name]));
        }
        let [archdir, libdir] = install_dirs(ctx);
        steps.push(BuildStep::new("rake", &[]).arg(archdir).arg(libdir));
        steps
    }
}

/// `*.sh`: a plain shell script that installs into `$PREFIX`.
#[derive(Debug, Clone, Copy)]
pub struct ShellBuilder;

impl ExtensionBuilder for ShellBuilder {
    fn handles(&self, file_name: &str) -> bool {
        Path::new(file_name)
            .extension()
            .is_some_and(|ext| ext == "sh")
    }

    fn steps(&self, build_file: &Path, ctx: &BuildContext) -> Vec<BuildStep> {
        vec![
            BuildStep::new("sh", &[&file_name(build_file)])
                .env("PREFIX", ctx.dest.display().to_string()),
        ]
    }
}

/// Maps build files to builders.
#[derive(Debug)]
pub struct BuilderRegistry {
    builders: Vec<Box<dyn ExtensionBuilder>>,
}

impl Default for BuilderRegistry {
    fn default() -> Self {
        Self {
            builders: vec![
                Box::new(ExtConfBuilder),
                Box::new(ConfigureBuilder),
                Box::new(RakeBuilder),
                Box::new(ShellBuilder),
            ],
        }
    }
}

impl BuilderRegistry {
    /// A registry with no builders.
    pub fn empty() -> Self {
        Self {
            builders: Vec::new(),
        }
    }

    /// Register a builder. Later registrations are consulted first.
    pub fn register(&mut self, builder: impl ExtensionBuilder + 'static) {
        self.builders.insert(0, Box::new(builder));
    }

    /// The builder for `extension`, chosen by its file name.
    pub fn find(&self, extension: &str) -> Option<&dyn ExtensionBuilder> {
        let name = file_name(Path::new(extension));
        self.builders
            .iter()
            .find(|b| b.handles(&name))
            .map(|b| &**b)
    }

    /// Build one extension of the package unpacked at `ctx.gem_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionBuildError`] when no builder handles the file, a
    /// step cannot be started, exits unsuccessfully, or exceeds
    /// `ctx.timeout`.
    pub fn build(&self, extension: &str, ctx: &BuildContext) -> Result<(), ExtensionBuildError> {
        let log_path = ctx.gem_dir.join(BUILD_LOG);
        let fail = || ExtensionBuildError {
            extension: extension.to_string(),
            log: log_path.clone(),
        };

        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| {
                warn!("Cannot open build log {}: {e}", log_path.display());
                fail()
            })?;

        let Some(builder) = self.find(extension) else {
            let msg = format!("No builder for extension '{extension}'");
            warn!("{msg}");
            let _ = writeln!(log, "{msg}");
            return Err(fail());
        };

        let build_file = ctx.gem_dir.join(extension);
        let work_dir = build_file
            .parent()
            .unwrap_or(ctx.gem_dir.as_path())
            .to_path_buf();
        info!("Building native extension {extension}");

        for step in builder.steps(&build_file, ctx) {
            if let Err(reason) = run_step(&step, &work_dir, &mut log, ctx.timeout) {
                let _ = writeln!(log, "{reason}");
                warn!("{extension}: {reason}; see {}", log_path.display());
                return Err(fail());
            }
        }

        debug!("Built {extension}");
        Ok(())
    }
}

fn run_step(
    step: &BuildStep,
    work_dir: &Path,
    log: &mut File,
    timeout: Duration,
) -> Result<(), String> {
    writeln!(log, "{step}").map_err(|e| e.to_string())?;
    let stdout = log.try_clone().map_err(|e| e.to_string())?;
    let stderr = log.try_clone().map_err(|e| e.to_string())?;

    let jobs = num_cpus::get().to_string();
    let mut command = Command::new(&step.program);
    command
        .args(&step.args)
        .current_dir(work_dir)
        .env("JOBS", &jobs)
        .env("MAKEFLAGS", format!("-j{jobs}"))
        .envs(step.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    debug!("Running {step} in {}", work_dir.display());
    let mut child = command
        .spawn()
        .map_err(|e| format!("{}: {e}", step.program.display()))?;

    match child.wait_timeout(timeout).map_err(|e| e.to_string())? {
        Some(status) if status.success() => Ok(()),
        Some(status) => Err(format!("{step} failed with {status}")),
        None => {
            let _ = child.kill();
            let _ = child.wait();
            Err(format!("{step} timed out after {}s", timeout.as_secs()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(gem_dir: &Path) -> BuildContext {
        BuildContext {
            interpreter: PathBuf::from("/usr/bin/ruby"),
            gem_dir: gem_dir.to_path_buf(),
            dest: gem_dir.join("lib"),
            timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_registry_selects_by_file_name() {
        let registry = BuilderRegistry::default();
        let cases = [
            ("ext/a/extconf.rb", true),
            ("ext/configure", true),
            ("ext/a/Rakefile", true),
            ("ext/mkrf_conf.rb", true),
            ("ext/build.sh", true),
            ("ext/CMakeLists.txt", false),
            ("", false),
        ];
        for (ext, expected) in cases {
            assert_eq!(registry.find(ext).is_some(), expected, "{ext}");
        }
    }

    #[test]
    fn test_extconf_steps() {
        let dir = Path::new("/gems/a-1");
        let steps = ExtConfBuilder.steps(&dir.join("ext/extconf.rb"), &ctx(dir));
        let rendered: Vec<String> = steps.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "/usr/bin/ruby extconf.rb".to_string(),
                "make RUBYARCHDIR=/gems/a-1/lib RUBYLIBDIR=/gems/a-1/lib".to_string(),
                "make RUBYARCHDIR=/gems/a-1/lib RUBYLIBDIR=/gems/a-1/lib install".to_string(),
            ]
        );
    }

    #[test]
    fn test_rake_steps_with_mkrf() {
        let dir = Path::new("/gems/a-1");
        let steps = RakeBuilder.steps(&dir.join("ext/mkrf_conf.rb"), &ctx(dir));
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].to_string(), "/usr/bin/ruby mkrf_conf.rb");
        assert_eq!(steps[1].program, PathBuf::from("rake"));
    }

    #[test]
    fn test_missing_builder_logged() {
        let dir = tempfile::tempdir().unwrap();
        let err = BuilderRegistry::default()
            .build("", &ctx(dir.path()))
            .unwrap_err();

        assert_eq!(err.to_string(), "Failed to build native extension.");
        let log = std::fs::read_to_string(dir.path().join(BUILD_LOG)).unwrap();
        assert_eq!(log, "No builder for extension ''\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_build_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("ext")).unwrap();
        std::fs::write(dir.path().join("ext/ok.sh"), "echo built-ok\n").unwrap();
        std::fs::write(dir.path().join("ext/bad.sh"), "echo broken >&2\nexit 3\n").unwrap();

        let registry = BuilderRegistry::default();
        registry.build("ext/ok.sh", &ctx(dir.path())).unwrap();
        let err = registry.build("ext/bad.sh", &ctx(dir.path())).unwrap_err();
        assert_eq!(err.extension, "ext/bad.sh");

        let log = std::fs::read_to_string(dir.path().join(BUILD_LOG)).unwrap();
        assert!(log.contains("sh ok.sh\nbuilt-ok\n"), "{log}");
        assert!(log.contains("sh bad.sh\nbroken\n"), "{log}");
        assert!(log.contains("failed"), "{log}");
    }

    #[cfg(unix)]
    #[test]
    fn test_step_timeout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("slow.sh"), "sleep 5\n").unwrap();
        let mut ctx = ctx(dir.path());
        ctx.timeout = Duration::from_millis(100);

        assert!(BuilderRegistry::default().build("slow.sh", &ctx).is_err());
        let log = std::fs::read_to_string(dir.path().join(BUILD_LOG)).unwrap();
        assert!(log.contains("timed out"), "{log}");
    }
}
