use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use backfill::sources::discord::DEFAULT_API_BASE;
use backfill::{BackfillConfig, CursorPolicy};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub discord_token: String,
    pub database_url: String,
    pub discord_api_base: String,
    pub requests_per_second: u32,
    /// Keep cursors in this JSON file instead of the database
    pub cursor_file: Option<PathBuf>,
    pub backfill: BackfillConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut backfill = BackfillConfig::default();
        if let Some(size) = parse_var(&var, "BACKFILL_PAGE_SIZE")? {
            backfill = backfill.with_page_size(size);
        }
        if let Some(secs) = parse_var::<f64>(&var, "BACKFILL_PROGRESS_THRESHOLD_SECS")? {
            let threshold = Duration::try_from_secs_f64(secs)
                .context("BACKFILL_PROGRESS_THRESHOLD_SECS must be a non-negative number")?;
            backfill = backfill.with_progress_threshold(threshold);
        }
        if let Some(workers) = parse_var(&var, "BACKFILL_MAX_WORKERS")? {
            backfill = backfill.with_max_workers(workers);
        }
        if let Some(channels) = parse_var(&var, "BACKFILL_MAX_CONCURRENT_CHANNELS")? {
            backfill = backfill.with_max_concurrent_channels(channels);
        }
        if let Some(pending) = parse_var(&var, "BACKFILL_MAX_PENDING_WRITES")? {
            backfill = backfill.with_max_pending_writes(pending);
        }
        if let Some(policy) = parse_var::<CursorPolicy>(&var, "BACKFILL_CURSOR_POLICY")? {
            backfill = backfill.with_cursor_policy(policy);
        }
        backfill.validate().context("invalid BACKFILL_* settings")?;

        Ok(Self {
            discord_token: var("DISCORD_TOKEN").context("DISCORD_TOKEN must be set")?,
            database_url: var("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://backfill.db?mode=rwc".to_string()),
            discord_api_base: var("DISCORD_API_BASE")
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            requests_per_second: parse_var(&var, "DISCORD_REQUESTS_PER_SECOND")?.unwrap_or(40),
            cursor_file: var("BACKFILL_CURSOR_FILE").map(PathBuf::from),
            backfill,
        })
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("{name} is invalid: {e}"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(lookup(&[("DISCORD_TOKEN", "abc")])).unwrap();

        assert_eq!(config.discord_token, "abc");
        assert_eq!(config.database_url, "sqlite://backfill.db?mode=rwc");
        assert_eq!(config.requests_per_second, 40);
        assert!(config.cursor_file.is_none());
        assert_eq!(config.backfill.page_size, 100);
    }

    #[test]
    fn test_token_is_required() {
        assert!(AppConfig::from_lookup(lookup(&[])).is_err());
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("DISCORD_TOKEN", "abc"),
            ("BACKFILL_PAGE_SIZE", "50"),
            ("BACKFILL_PROGRESS_THRESHOLD_SECS", "5"),
            ("BACKFILL_CURSOR_POLICY", "on_submit"),
            ("BACKFILL_CURSOR_FILE", "settings.json"),
        ]))
        .unwrap();

        assert_eq!(config.backfill.page_size, 50);
        assert_eq!(config.backfill.progress_threshold, Duration::from_secs(5));
        assert_eq!(config.backfill.cursor_policy, CursorPolicy::OnSubmit);
        assert_eq!(config.cursor_file, Some(PathBuf::from("settings.json")));
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let result = AppConfig::from_lookup(lookup(&[
            ("DISCORD_TOKEN", "abc"),
            ("BACKFILL_MAX_WORKERS", "many"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_page_size_is_rejected() {
        let result = AppConfig::from_lookup(lookup(&[
            ("DISCORD_TOKEN", "abc"),
            ("BACKFILL_PAGE_SIZE", "0"),
        ]));
        assert!(result.is_err());
    }
}
