//! Activate command

use anyhow::Result;
use crossterm::style::Stylize;
use gemstone_core::{ActivationEngine, Config};

use super::{load_index, parse_requirement};

/// Activate `name` and its runtime dependencies, then print what was
/// activated and the resulting load path.
pub fn activate(config: &Config, name: &str, version: Option<&str>, require: bool) -> Result<()> {
    let requirement = parse_requirement(version)?;
    let index = load_index(config)?;

    let mut engine = ActivationEngine::new(index, config.platforms.clone());
    engine.activate_with(name, &requirement, require)?;

    let mut active: Vec<_> = engine.activated_specs().collect();
    active.sort();
    for spec in active {
        println!("{} {}", spec.name.as_str().bold(), spec.version.to_string().dark_grey());
    }
    println!();
    for dir in engine.load_path() {
        println!("{}", dir.display());
    }
    Ok(())
}
