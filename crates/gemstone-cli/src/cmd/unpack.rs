//! Unpack command

use std::path::{Path, PathBuf};

use anyhow::Result;
use gemstone_core::{Archive, Config, Installer, PackageArchive, Reporter};

/// Extract `package` into `target`, or `./<full_name>` when unset.
pub fn unpack(
    config: &Config,
    package: &Path,
    target: Option<PathBuf>,
    reporter: &dyn Reporter,
) -> Result<()> {
    let archive = PackageArchive::open(package)?;
    let dest = target.unwrap_or_else(|| PathBuf::from(archive.specification().full_name()));

    Installer::new(&archive, config).unpack(&dest)?;
    reporter.info(&format!(
        "Unpacked {} into {}",
        archive.specification().full_name(),
        dest.display()
    ));
    Ok(())
}
