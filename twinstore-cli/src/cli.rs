use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "twinstore",
    about = "twinstore - dual-store replication operator tool",
    version = env!("CARGO_PKG_VERSION"),
    author,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(
        short,
        long,
        global = true,
        env = "TWINSTORE_CONFIG",
        help = "Path to twinstore.json (defaults to the data directory)"
    )]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Connect to both stores and report reachability")]
    Check,

    #[command(subcommand, about = "View configuration")]
    Config(ConfigCommands),

    #[command(subcommand, about = "Inspect and replay failed replications")]
    DeadLetters(DeadLetterCommands),
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    #[command(about = "Show the effective configuration (credentials redacted)")]
    Show {
        #[arg(short, long, help = "Output as JSON")]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum DeadLetterCommands {
    #[command(about = "List dead-lettered replications, oldest first")]
    List {
        #[arg(short, long, help = "Output as JSON")]
        json: bool,

        #[arg(short = 'n', long, help = "Show at most this many entries")]
        limit: Option<usize>,
    },

    #[command(about = "Re-run every dead-lettered replication against its target")]
    Replay,

    #[command(about = "Delete all dead-lettered replications")]
    Purge {
        #[arg(long, help = "Skip the confirmation guard")]
        yes: bool,
    },
}
