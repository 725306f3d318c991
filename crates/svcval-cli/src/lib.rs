//! svcval CLI library

pub mod commands;
pub mod config;
pub mod error;
pub mod scenario;
pub mod scenarios;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// svcval - Kubernetes service reachability validation
#[derive(Parser, Debug)]
#[command(name = "svcval")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the test topology and run scenarios against it
    Run(commands::run::RunArgs),
    /// List available scenarios
    List,
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Run(args) => commands::run::run(args).await,
            Commands::List => {
                commands::list::run();
                Ok(())
            }
        }
    }
}
