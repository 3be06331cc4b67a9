//! CLI output formatting

use crate::broker::BrokerStats;
use crate::execution::Outcome;
use crate::persistence::Document;
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Spinner shown while a ladder climbs
pub fn create_spinner(message: impl Into<String>) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(template) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed}] {msg}") {
        spinner.set_style(template);
    }
    spinner.set_message(message.into());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// One line summarizing a finished invocation
pub fn format_outcome(name: &str, outcome: &Outcome) -> String {
    match &outcome.error {
        None => format!(
            "{} {} completed {} (scope {})",
            CHECK,
            style(name).bold(),
            style("successfully").green(),
            style(outcome.lineage.scope_id).dim()
        ),
        Some(error) => format!(
            "{} {} {} [{}]: {}",
            CROSS,
            style(name).bold(),
            style("failed").red(),
            style(error.status_code()).yellow(),
            style(error).red()
        ),
    }
}

/// A stored document as `key=value` pairs in key order
pub fn format_document(document: &Document) -> String {
    let mut keys: Vec<&String> = document.keys().collect();
    keys.sort();
    keys.iter()
        .map(|key| {
            let value = &document[key.as_str()];
            let value = value
                .as_str()
                .map(String::from)
                .unwrap_or_else(|| value.to_string());
            format!("{}={}", style(key).cyan(), value)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Broker call counters for display
pub fn format_broker_stats(stats: &BrokerStats) -> String {
    format!(
        "connects: {} (refused {}), channels: {}, exchanges: {}, queues: {}, bindings: {}, published: {}",
        style(stats.connects).cyan(),
        style(stats.refused).yellow(),
        style(stats.channels).cyan(),
        style(stats.exchanges).cyan(),
        style(stats.queues).cyan(),
        style(stats.bindings).cyan(),
        style(stats.published).green()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_document_sorts_keys() {
        let mut document = Document::new();
        document.insert("greeteeId".to_string(), json!("r1"));
        document.insert("count".to_string(), json!(2));
        document.insert("greeterId".to_string(), json!("h1"));

        let line = console::strip_ansi_codes(&format_document(&document)).to_string();
        assert_eq!(line, "count=2 greeteeId=r1 greeterId=h1");
    }

    #[test]
    fn test_format_broker_stats() {
        let stats = BrokerStats {
            connects: 1,
            refused: 2,
            exchanges: 3,
            ..BrokerStats::default()
        };
        let line = console::strip_ansi_codes(&format_broker_stats(&stats)).to_string();
        assert!(line.starts_with("connects: 1 (refused 2), channels: 0, exchanges: 3"));
    }
}
