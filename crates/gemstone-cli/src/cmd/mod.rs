//! Subcommand implementations.

pub mod activate;
pub mod build;
pub mod contents;
pub mod install;
pub mod list;
pub mod unpack;

use std::path::PathBuf;

use anyhow::{Context, Result};
use gemstone_core::{Config, Requirement, SourceIndex};

/// Load configuration for `home`, or for the default install root.
pub fn load_config(home: Option<PathBuf>) -> Result<Config> {
    let config = match home {
        Some(home) => Config::load_from(home)?,
        None => Config::load()?,
    };
    Ok(config)
}

/// Index of everything installed under the configured roots.
pub fn load_index(config: &Config) -> Result<SourceIndex> {
    SourceIndex::from_dirs(&config.spec_dirs()).context("Failed to read installed specifications")
}

/// Parse an optional `--version` argument. Absent means any version.
pub fn parse_requirement(text: Option<&str>) -> Result<Requirement> {
    text.map_or_else(
        || Ok(Requirement::default()),
        |text| {
            Requirement::parse(text)
                .with_context(|| format!("Invalid version requirement '{text}'"))
        },
    )
}
