//! twinstore - operator CLI
//!
//! Inspects a replication deployment from outside the host process:
//! - checks that both configured stores are reachable
//! - prints the effective configuration with credentials masked
//! - lists, replays and purges dead-lettered replications

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

mod cli;
mod commands;
mod config_commands;
mod dead_letter_commands;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter).with_writer(std::io::stderr).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config_path = commands::resolve_config_path(cli.config)?;
    debug!(path = %config_path.display(), "Using config file");

    match cli.command {
        Commands::Check => commands::handle_check(&config_path).await,
        Commands::Config(cmd) => commands::handle_config_command(cmd, &config_path).await,
        Commands::DeadLetters(cmd) => commands::handle_dead_letter_command(cmd, &config_path).await,
    }
}
