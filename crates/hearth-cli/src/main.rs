//! Hearth command-line driver.
//!
//! Runs a scripted sync session against the in-memory backend and prints the
//! resulting cache statistics.

mod formatter;
mod session;

use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use formatter::OutputFormat;
use hearth_sync::SyncConfig;

/// Hearth sync session driver
#[derive(Parser, Debug)]
#[command(name = "hearth")]
#[command(version, about = "Run a Hearth sync session against an in-memory backend")]
pub struct Args {
    /// Family (scope) to attach
    #[arg(long, default_value = "demo-family")]
    pub family: String,

    /// Maximum number of cached entries
    #[arg(long, default_value_t = 100)]
    pub max_cache_entries: usize,

    /// TTL in seconds for kinds without an override
    #[arg(long, default_value_t = 120)]
    pub default_ttl_secs: u64,

    /// Per-kind TTL override, e.g. --ttl chores=30 (repeatable)
    #[arg(long = "ttl", value_parser = parse_ttl)]
    pub ttl: Vec<(String, u64)>,

    /// Expiry sweep interval in seconds (0 disables)
    #[arg(long, default_value_t = 0)]
    pub sweep_interval_secs: u64,

    /// Output format
    #[arg(long, default_value = "table", value_enum)]
    pub format: OutputFormat,
}

impl Args {
    /// Convert CLI arguments to a sync configuration.
    pub fn into_config(&self) -> SyncConfig {
        let mut config = SyncConfig::default()
            .with_default_ttl(Duration::from_secs(self.default_ttl_secs))
            .with_max_cache_entries(self.max_cache_entries);

        for (kind, secs) in &self.ttl {
            config = config.with_kind_ttl(kind.clone(), Duration::from_secs(*secs));
        }

        if self.sweep_interval_secs > 0 {
            config = config.with_sweep_interval(Duration::from_secs(self.sweep_interval_secs));
        }

        config
    }
}

/// Parse a `kind=secs` TTL override.
fn parse_ttl(value: &str) -> Result<(String, u64), String> {
    let (kind, secs) = value
        .split_once('=')
        .ok_or_else(|| format!("expected kind=secs, got '{value}'"))?;
    if kind.is_empty() {
        return Err("kind must not be empty".to_string());
    }
    let secs = secs
        .parse::<u64>()
        .map_err(|e| format!("invalid seconds '{secs}': {e}"))?;
    Ok((kind.to_string(), secs))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "hearth=info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.into_config();
    let formatter = formatter::create_formatter(args.format);

    let report = session::run(&args.family, config).await?;
    println!("{}", formatter.format_report(&report));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ttl() {
        assert_eq!(parse_ttl("chores=30").unwrap(), ("chores".to_string(), 30));
        assert!(parse_ttl("chores").is_err());
        assert!(parse_ttl("=30").is_err());
        assert!(parse_ttl("chores=soon").is_err());
    }

    #[test]
    fn test_args_into_config() {
        let args = Args::parse_from([
            "hearth",
            "--family",
            "fam7",
            "--max-cache-entries",
            "10",
            "--default-ttl-secs",
            "90",
            "--ttl",
            "chores=15",
            "--ttl",
            "leaderboard=5",
            "--sweep-interval-secs",
            "30",
            "--format",
            "json",
        ]);
        let config = args.into_config();

        assert_eq!(args.family, "fam7");
        assert_eq!(args.format, OutputFormat::Json);
        assert_eq!(config.max_cache_entries, 10);
        assert_eq!(config.ttl_for("chores"), Duration::from_secs(15));
        assert_eq!(config.ttl_for("leaderboard"), Duration::from_secs(5));
        assert_eq!(config.ttl_for("members"), Duration::from_secs(300));
        assert_eq!(config.ttl_for("unknown"), Duration::from_secs(90));
        assert_eq!(config.sweep_interval, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_zero_sweep_interval_disables_sweeper() {
        let args = Args::parse_from(["hearth"]);
        assert!(args.into_config().sweep_interval.is_none());
    }
}
