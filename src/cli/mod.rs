//! Command-line interface.

mod check;
mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::app::Config;
use crate::error::Result;

pub use check::check;
pub use run::run;

/// Tradewind - algorithmic crypto-trading engine.
#[derive(Parser, Debug)]
#[command(name = "tradewind")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "tradewind.toml")]
    pub config: PathBuf,

    /// Override log level (debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the trading engine (foreground)
    Run(RunArgs),

    /// Validate configuration and dependencies, then exit
    Check,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Use JSON log format instead of pretty
    #[arg(long)]
    pub json_logs: bool,
}

impl Cli {
    /// Load configuration, falling back to environment-only defaults when
    /// the default config file does not exist and none was named explicitly.
    pub fn load_config(&self) -> Result<Config> {
        if self.config.exists() {
            Config::load(&self.config)
        } else if self.config == PathBuf::from("tradewind.toml") {
            Config::from_env()
        } else {
            // An explicitly named file must exist.
            Config::load(&self.config)
        }
    }
}
