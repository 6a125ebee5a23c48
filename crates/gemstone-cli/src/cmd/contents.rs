//! Contents command

use anyhow::{Result, bail};
use gemstone_core::{Config, contents as installed_contents};

use super::{load_index, parse_requirement};

/// Print every file of the newest matching installed package.
pub fn contents(config: &Config, name: &str, version: Option<&str>) -> Result<()> {
    let requirement = parse_requirement(version)?;
    let index = load_index(config)?;

    let Some(files) = installed_contents(&index, name, &requirement) else {
        bail!("Unable to find package '{name}' ({requirement}) in {}", config.home.display());
    };
    for file in files {
        println!("{}", file.display());
    }
    Ok(())
}
