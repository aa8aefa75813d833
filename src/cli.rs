//! Command-line surface. Grounded on the teacher's `bootupctl`/`bootupd`
//! clap-derive shape, collapsed here into the single `rbgen` binary
//! this crate ships (spec names one tool, not a daemon/client pair).

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::LevelFilter;

use crate::config::Config;
use crate::runner::{DryRunRunner, RealRunner, Runner};

#[derive(Parser, Debug)]
#[command(name = "rbgen", about = "Generates boot-manager menu entries for copy-on-write snapshots")]
pub struct Cli {
    /// Increase logging verbosity; repeatable (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to an explicit config.toml; overrides the compiled-in default.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Show what would change without writing anything.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Skip the interactive confirmation prompt.
    #[arg(short = 'y', long, global = true)]
    yes: bool,

    /// Proceed even if currently booted from a snapshot.
    #[arg(long, global = true)]
    force: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan snapshots, plan boot entries, and (after confirmation) rewrite
    /// the bootloader's managed config files.
    Generate,
    /// List discovered snapshots along with their on-disk size.
    List,
}

impl Cli {
    pub fn loglevel(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    pub fn run(&self) -> Result<()> {
        let config = Config::load_or_default(self.config.as_deref())?;
        let runner: Box<dyn Runner> = if self.dry_run {
            Box::new(DryRunRunner)
        } else {
            Box::new(RealRunner)
        };

        match self.command {
            Command::Generate => crate::generate(&config, runner.as_ref(), self.yes || self.dry_run, self.force),
            Command::List => crate::list(&config),
        }
    }
}
