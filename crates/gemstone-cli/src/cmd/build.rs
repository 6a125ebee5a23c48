//! Build command

use std::path::Path;

use anyhow::{Context, Result};
use gemstone_core::{PackageBuilder, Reporter, Specification};

/// Package the files `spec` lists, read from `source_dir`.
pub fn build(
    spec: &Path,
    source_dir: &Path,
    output_dir: &Path,
    reporter: &dyn Reporter,
) -> Result<()> {
    let spec = Specification::from_file(spec)
        .with_context(|| format!("Failed to read {}", spec.display()))?;
    let package = PackageBuilder::build(&spec, source_dir, output_dir)?;

    reporter.info(&format!("Successfully built {}", spec.full_name()));
    reporter.info(&format!("  File: {}", package.display()));
    Ok(())
}
