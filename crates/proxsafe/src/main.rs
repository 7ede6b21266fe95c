//! proxsafe CLI - restore Proxmox VE and Proxmox Backup Server configuration
//!
//! This is the main entry point for the proxsafe command-line interface.

mod cli;
mod commands;
mod output;
mod signals;
mod version;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);

    let cancel = CancellationToken::new();
    tokio::spawn(signals::cancel_on_signal(cancel.clone()));

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Restore(args) => commands::restore::run(args, config, &cancel).await,
        Commands::Decrypt => commands::decrypt::run(config, &cancel).await,
        Commands::CleanupTemp(args) => commands::cleanup::run(args, config),
        Commands::RollbackSnapshot(args) => commands::snapshot::run(args, config),
        Commands::Categories(args) => commands::categories::run(args),
        Commands::Version(args) => commands::version::run(args),
    }
}

/// Initialize tracing with appropriate verbosity
fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}
