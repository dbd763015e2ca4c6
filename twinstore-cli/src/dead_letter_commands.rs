use anyhow::{Context, Result};
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Cell, Color, Table};

use twinstore_core::modules::config as core_config;
use twinstore_core::store;
use twinstore_core::sync::{DeadLetterLog, RetryPolicy, RoutingTable};
use twinstore_core::{SyncCoordinator, SyncGuardSet};
use twinstore_types::SyncConfig;

fn open_log(config: &SyncConfig) -> Result<DeadLetterLog> {
    let path = core_config::dead_letter_path(config)?;
    DeadLetterLog::open(&path)
        .with_context(|| format!("Failed to open dead-letter log at {}", path.display()))
}

pub fn list_dead_letters(config: &SyncConfig, json: bool, limit: Option<usize>) -> Result<()> {
    let log = open_log(config)?;
    let letters = log.list(limit)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&letters)?);
        return Ok(());
    }

    if letters.is_empty() {
        println!("{}", "No dead-lettered replications.".green());
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Id", "Record", "Operation", "Route", "Reason", "Attempts", "Failed At", "Error"]);

    for letter in &letters {
        let route = format!(
            "{} → {}",
            letter.task.source,
            letter.target.as_ref().map_or_else(|| "?".to_string(), ToString::to_string)
        );
        table.add_row(vec![
            Cell::new(letter.id()),
            Cell::new(letter.task.sync_key()),
            Cell::new(letter.task.operation),
            Cell::new(route),
            Cell::new(letter.reason.as_str()).fg(Color::Yellow),
            Cell::new(letter.attempts),
            Cell::new(letter.failed_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(truncate(&letter.error, 60)).fg(Color::Red),
        ]);
    }

    println!("{table}");
    let total = log.count()?;
    if total > letters.len() {
        println!("\n{} of {} entries shown", letters.len(), total);
    } else {
        println!("\n{} entries total", total);
    }
    Ok(())
}

pub async fn replay_dead_letters(config: &SyncConfig) -> Result<()> {
    let log = open_log(config)?;
    let pending = log.count()?;
    if pending == 0 {
        println!("{}", "Nothing to replay.".green());
        return Ok(());
    }

    let primary = store::connect(&config.primary).await.context("Failed to open primary store")?;
    let replica = store::connect(&config.replica).await.context("Failed to open replica store")?;

    // Failures are re-recorded by the replay itself, so the coordinator gets no log of its own.
    let coordinator = SyncCoordinator::new(
        RoutingTable::from_config(config),
        [primary, replica],
        SyncGuardSet::new(),
    )
    .with_retry(RetryPolicy::from(config.retry))
    .with_timeout(config.transaction_timeout());

    println!("Replaying {} entries...", pending);
    let report = log.replay(&coordinator).await;
    coordinator.close_stores().await;
    let report = report?;

    println!("{} {} replayed", "✓".green(), report.replayed);
    if report.superseded > 0 {
        println!("{} {} dropped, newer write already replicated", "•".dimmed(), report.superseded);
    }
    if report.deferred > 0 {
        println!("{} {} deferred", "•".yellow(), report.deferred);
    }
    if report.failed > 0 {
        println!("{} {} failed again", "✗".red(), report.failed);
        anyhow::bail!("{} replications still failing", report.failed);
    }
    Ok(())
}

pub fn purge_dead_letters(config: &SyncConfig, yes: bool) -> Result<()> {
    let log = open_log(config)?;
    let count = log.count()?;
    if count == 0 {
        println!("{}", "Dead-letter log is already empty.".green());
        return Ok(());
    }
    if !yes {
        anyhow::bail!("Refusing to delete {} entries without --yes", count);
    }

    let removed = log.purge()?;
    println!("{} Purged {} entries", "✓".green(), removed);
    Ok(())
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{head}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 5), "abcd…");
        assert_eq!(truncate("ошибка базы", 4).chars().count(), 4);
    }
}
