//! Terminal output.

use crossterm::style::Stylize;
use gemstone_core::{Reporter, Version};

/// Prints install progress and messages to the terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleReporter {
    quiet: bool,
}

impl ConsoleReporter {
    /// A reporter that drops progress lines when `quiet` is set.
    /// Warnings and errors are always printed.
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl Reporter for ConsoleReporter {
    fn section(&self, title: &str) {
        if !self.quiet {
            println!();
            println!("{}", title.bold());
        }
    }

    fn installing(&self, name: &str, version: &Version) {
        if !self.quiet {
            println!("  {} {} {}", "•".dark_grey(), name, version.to_string().dark_grey());
        }
    }

    fn done(&self, name: &str, version: &Version, detail: &str) {
        if !self.quiet {
            println!(
                "  {} {} {} {}",
                "✓".green(),
                name,
                version.to_string().dark_grey(),
                detail.dark_grey()
            );
        }
    }

    fn failed(&self, name: &str, version: &Version, reason: &str) {
        eprintln!("  {} {} {} {}", "✗".red(), name, version.to_string().dark_grey(), reason);
    }

    fn info(&self, msg: &str) {
        if !self.quiet {
            println!("{msg}");
        }
    }

    fn warning(&self, msg: &str) {
        eprintln!("{} {msg}", "warning:".yellow().bold());
    }

    fn error(&self, msg: &str) {
        eprintln!("{} {msg}", "error:".red().bold());
    }
}
