use anyhow::{Context, Result};
use colored::Colorize;
use std::path::{Path, PathBuf};

use twinstore_core::modules::config as core_config;
use twinstore_core::store;
use twinstore_types::SyncConfig;

use crate::cli::{ConfigCommands, DeadLetterCommands};

mod config_commands_impl {
    pub use crate::config_commands::*;
}
mod dead_letter_commands_impl {
    pub use crate::dead_letter_commands::*;
}

/// Resolve `--config`, falling back to `<data dir>/twinstore.json`.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => core_config::default_config_path().context("Failed to resolve data directory"),
    }
}

pub fn load(path: &Path) -> Result<SyncConfig> {
    core_config::load_config(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

pub async fn handle_check(config_path: &Path) -> Result<()> {
    let config = load(config_path)?;
    let mut unreachable = 0usize;

    for store_config in [&config.primary, &config.replica] {
        let label = format!("{} ({})", store_config.id, store_config.redacted_url());
        let result = match store::connect(store_config).await {
            Ok(store) => {
                let ping = store.ping().await.map_err(anyhow::Error::from);
                store.close().await;
                ping
            }
            Err(e) => Err(anyhow::Error::from(e)),
        };

        match result {
            Ok(()) => println!("{} {}", "✓".green(), label),
            Err(e) => {
                unreachable += 1;
                println!("{} {}: {:#}", "✗".red(), label, e);
            }
        }
    }

    if unreachable > 0 {
        anyhow::bail!("{} store(s) unreachable", unreachable);
    }
    Ok(())
}

pub async fn handle_config_command(cmd: ConfigCommands, config_path: &Path) -> Result<()> {
    match cmd {
        ConfigCommands::Show { json } => config_commands_impl::show_config(config_path, json),
    }
}

pub async fn handle_dead_letter_command(cmd: DeadLetterCommands, config_path: &Path) -> Result<()> {
    let config = load(config_path)?;
    match cmd {
        DeadLetterCommands::List { json, limit } => {
            dead_letter_commands_impl::list_dead_letters(&config, json, limit)
        }
        DeadLetterCommands::Replay => dead_letter_commands_impl::replay_dead_letters(&config).await,
        DeadLetterCommands::Purge { yes } => {
            dead_letter_commands_impl::purge_dead_letters(&config, yes)
        }
    }
}
