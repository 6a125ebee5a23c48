//! Install command

use std::path::PathBuf;

use anyhow::{Context, Result};
use gemstone_core::{
    Archive, Config, InstallLock, InstallOptions, Installer, PackageArchive, Reporter, SourceIndex,
};
use tracing::debug;

/// Install each package file in order.
///
/// Later packages see earlier ones as installed, so a dependency can be
/// listed before its dependents on one command line.
pub fn install(
    config: &Config,
    packages: &[PathBuf],
    options: InstallOptions,
    reporter: &dyn Reporter,
) -> Result<()> {
    let root = options.install_root.clone().unwrap_or_else(|| config.home.clone());
    let _lock = InstallLock::acquire(&root.join(".lock"))
        .with_context(|| format!("Failed to lock {}", root.display()))?;

    let mut spec_dirs = config.spec_dirs();
    if let Some(extra) = &options.install_root {
        spec_dirs.insert(0, extra.join("specifications"));
    }

    reporter.section("Installing");
    for path in packages {
        let index = SourceIndex::from_dirs(&spec_dirs)
            .context("Failed to read installed specifications")?;
        debug!("{} packages installed before {}", index.len(), path.display());

        let archive = PackageArchive::open(path)?;
        let installer = Installer::new(&archive, config)
            .with_options(options.clone())
            .with_reporter(reporter);

        if let Err(e) = installer.install(&index) {
            let spec = archive.specification();
            reporter.failed(&spec.name, &spec.version, &e.to_string());
            return Err(e).with_context(|| format!("Failed to install {}", path.display()));
        }
    }

    Ok(())
}
