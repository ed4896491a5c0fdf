//! Output formatters for session reports.

use clap::ValueEnum;
use comfy_table::Table;

use crate::session::SessionReport;

/// Output format for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Trait for formatting output.
pub trait Formatter: Send + Sync {
    fn format_report(&self, report: &SessionReport) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_report(&self, report: &SessionReport) -> String {
        let mut tables = Table::new();
        tables.set_header(vec!["Table", "Rows", "TTL (s)"]);
        for table in &report.tables {
            tables.add_row(vec![
                table.table.to_string(),
                table.rows.to_string(),
                table.ttl_secs.to_string(),
            ]);
        }

        let stats = &report.stats;
        let mut cache = Table::new();
        cache.set_header(vec!["Statistic", "Value"]);
        for (name, value) in [
            ("hits", stats.hits.to_string()),
            ("misses", stats.misses.to_string()),
            ("hit rate", stats.hit_rate_percent()),
            ("sets", stats.sets.to_string()),
            ("evictions", stats.evictions.to_string()),
            ("expirations", stats.expirations.to_string()),
            ("size", stats.size.to_string()),
        ] {
            cache.add_row(vec![name.to_string(), value]);
        }

        format!(
            "Family: {} ({} subscriptions, {} failed, refresh {})\n\n{}\n\n{}",
            report.family,
            report.subscribed,
            report.failed_subscriptions,
            if report.refreshed { "observed" } else { "missed" },
            tables,
            cache
        )
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format_report(&self, report: &SessionReport) -> String {
        let mut value = serde_json::to_value(report).unwrap_or_else(|_| serde_json::json!({}));
        if let Some(stats) = value.get_mut("stats").and_then(|s| s.as_object_mut()) {
            stats.insert(
                "hit_rate_percent".to_string(),
                serde_json::Value::String(report.stats.hit_rate_percent()),
            );
        }
        serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string())
    }
}
