//! List command

use std::collections::BTreeMap;

use anyhow::Result;
use crossterm::style::Stylize;
use gemstone_core::Config;

use super::load_index;

/// Print installed packages, one line per name, newest version first.
pub fn list(config: &Config) -> Result<()> {
    let index = load_index(config)?;
    if index.is_empty() {
        println!("No packages installed.");
        return Ok(());
    }

    let mut by_name: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for spec in index.iter() {
        by_name
            .entry(spec.name.as_str())
            .or_default()
            .insert(0, spec.version.to_string());
    }

    for (name, versions) in by_name {
        println!("{} ({})", name.bold(), versions.join(", "));
    }
    Ok(())
}
