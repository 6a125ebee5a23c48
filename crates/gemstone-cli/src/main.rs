//! gemstone - package activation and installation CLI

use anyhow::Result;
use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use gemstone_cli::cmd;
use gemstone_cli::ui::ConsoleReporter;
use gemstone_cli::{Cli, Commands};
use gemstone_core::InstallOptions;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let reporter = ConsoleReporter::new(cli.quiet);

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(
            shell,
            &mut Cli::command(),
            "gemstone",
            &mut std::io::stdout(),
        );
        return Ok(());
    }

    let config = cmd::load_config(cli.home)?;

    match cli.command {
        Commands::Install {
            packages,
            force,
            ignore_dependencies,
            install_dir,
        } => {
            let options = InstallOptions {
                force,
                ignore_dependencies,
                install_root: install_dir,
            };
            cmd::install::install(&config, &packages, options, &reporter)
        }
        Commands::Unpack { package, target } => {
            cmd::unpack::unpack(&config, &package, target, &reporter)
        }
        Commands::Build {
            spec,
            source_dir,
            output_dir,
        } => cmd::build::build(&spec, &source_dir, &output_dir, &reporter),
        Commands::Contents { name, version } => {
            cmd::contents::contents(&config, &name, version.as_deref())
        }
        Commands::Activate { name, version, require } => {
            cmd::activate::activate(&config, &name, version.as_deref(), require)
        }
        Commands::List => cmd::list::list(&config),
        Commands::Completions { .. } => Ok(()),
    }
}
