use anyhow::Result;
use colored::Colorize;
use std::path::Path;

use twinstore_core::modules::config as core_config;
use twinstore_types::SyncConfig;

use crate::commands::load;

pub fn show_config(config_path: &Path, json: bool) -> Result<()> {
    let config = redacted(load(config_path)?);

    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let dead_letters = core_config::dead_letter_path(&config)
        .map(|path| path.display().to_string())
        .unwrap_or_else(|e| format!("unavailable ({e})"));

    println!("{}", "Replication Configuration:".cyan().bold());
    println!("  File: {}", config_path.display());
    println!("  Primary: {} ({})", config.primary.id, config.primary.url);
    println!("  Replica: {} ({})", config.replica.id, config.replica.url);
    println!("  Excluded namespaces: {}", format_namespaces(&config.excluded_namespaces));
    println!(
        "  Workers: {} (queue capacity {})",
        config.dispatch.workers, config.dispatch.queue_capacity
    );
    println!("  Transaction timeout: {} ms", config.transaction_timeout_ms);
    println!(
        "  Retry: {} attempts, {}..{} ms backoff",
        config.retry.max_attempts, config.retry.base_delay_ms, config.retry.max_delay_ms
    );
    println!("  Dead letters: {}", dead_letters);
    Ok(())
}

/// Copy of the config with store credentials masked.
fn redacted(mut config: SyncConfig) -> SyncConfig {
    config.primary.url = config.primary.redacted_url();
    config.replica.url = config.replica.redacted_url();
    config
}

fn format_namespaces(namespaces: &[String]) -> String {
    if namespaces.is_empty() {
        return "-".to_string();
    }
    namespaces.join(", ")
}
