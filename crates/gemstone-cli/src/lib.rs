//! gemstone - package activation and installation
#![allow(clippy::missing_errors_doc)]
//!
//! Command-line front end over `gemstone-core`.
//!
//! # Directory Layout
//!
//! ```text
//! ~/.gemstone/
//! ├── bin/             # Launchers for package executables
//! ├── cache/           # Copies of installed package files
//! ├── gems/            # Unpacked packages, one dir per <name>-<version>
//! ├── specifications/  # One descriptor per installed package
//! ├── config.toml      # Optional settings
//! └── .lock            # Held while installing
//! ```

pub mod cmd;
pub mod ui;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Version reported by `--version`.
pub const VERSION: &str = env!("GEMSTONE_BUILD_VERSION");

/// Top-level arguments.
#[derive(Debug, Parser)]
#[command(name = "gemstone")]
#[command(author, version = VERSION, about = "gemstone - install and activate packages")]
pub struct Cli {
    /// Install root (defaults to ~/.gemstone)
    #[arg(long, global = true, env = "GEMSTONE_HOME")]
    pub home: Option<PathBuf>,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Install package files
    Install {
        /// Package files (.gem)
        #[arg(required = true)]
        packages: Vec<PathBuf>,
        /// Skip runtime, package-manager and platform checks
        #[arg(long, short = 'f')]
        force: bool,
        /// Install even if runtime dependencies are missing
        #[arg(long)]
        ignore_dependencies: bool,
        /// Install into this root instead of the home
        #[arg(long, short = 'i')]
        install_dir: Option<PathBuf>,
    },
    /// Extract a package file without installing it
    Unpack {
        /// Package file (.gem)
        package: PathBuf,
        /// Directory to extract into (defaults to ./<name>-<version>)
        #[arg(long)]
        target: Option<PathBuf>,
    },
    /// Build a package file from a descriptor
    Build {
        /// Descriptor file (.spec)
        spec: PathBuf,
        /// Directory the listed files are read from
        #[arg(long, default_value = ".")]
        source_dir: PathBuf,
        /// Directory to write the package into
        #[arg(long, short = 'o', default_value = ".")]
        output_dir: PathBuf,
    },
    /// List the files of an installed package
    Contents {
        /// Package name
        name: String,
        /// Version requirement, e.g. "~> 1.2"
        #[arg(long, short = 'v')]
        version: Option<String>,
    },
    /// Activate a package and print the resulting load path
    Activate {
        /// Package name
        name: String,
        /// Version requirement, e.g. ">= 2, < 3"
        #[arg(long, short = 'v')]
        version: Option<String>,
        /// Also load the package's autorequire file
        #[arg(long)]
        require: bool,
    },
    /// List installed packages
    List,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}
