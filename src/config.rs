// src/config.rs
use log::{debug, warn};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_YAHOO_BASE_URL: &str = "https://query2.finance.yahoo.com";
pub const DEFAULT_CALENDAR_URL: &str =
    "https://www.investing.com/earnings-calendar/Service/getCalendarFilteredData";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub cache_dir: PathBuf,
    pub cache_retention_days: i64,
    pub proxy_enabled: bool,
    pub batch_size: usize,
    pub max_workers: usize,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub yahoo_base_url: String,
    pub calendar_url: String,
    pub proxy_refresh_cron: String,
    pub cache_sweep_cron: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            port: 3030,
            cache_dir: PathBuf::from("stock_cache"),
            cache_retention_days: 7,
            proxy_enabled: false,
            batch_size: 10,
            max_workers: 5,
            request_timeout_secs: 15,
            max_attempts: 3,
            yahoo_base_url: DEFAULT_YAHOO_BASE_URL.to_string(),
            calendar_url: DEFAULT_CALENDAR_URL.to_string(),
            proxy_refresh_cron: "0 */30 * * * *".to_string(),
            cache_sweep_cron: "0 0 3 * * *".to_string(),
        }
    }
}

impl AppConfig {
    /// Build from environment variables, falling back to defaults for anything unset.
    /// Callers are expected to have loaded `.env` already.
    pub fn from_env() -> Self {
        let defaults = AppConfig::default();
        AppConfig {
            port: parse_var("PORT", defaults.port),
            cache_dir: env::var("CACHE_DIR").map(PathBuf::from).unwrap_or(defaults.cache_dir),
            cache_retention_days: parse_var("CACHE_RETENTION_DAYS", defaults.cache_retention_days),
            proxy_enabled: parse_var("PROXY_ENABLED", defaults.proxy_enabled),
            batch_size: parse_var("SCAN_BATCH_SIZE", defaults.batch_size).max(1),
            max_workers: parse_var("SCAN_MAX_WORKERS", defaults.max_workers).max(1),
            request_timeout_secs: parse_var("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs),
            max_attempts: parse_var("MAX_ATTEMPTS", defaults.max_attempts).max(1),
            yahoo_base_url: env::var("YAHOO_BASE_URL").unwrap_or(defaults.yahoo_base_url),
            calendar_url: env::var("EARNINGS_CALENDAR_URL").unwrap_or(defaults.calendar_url),
            proxy_refresh_cron: env::var("PROXY_REFRESH_CRON").unwrap_or(defaults.proxy_refresh_cron),
            cache_sweep_cron: env::var("CACHE_SWEEP_CRON").unwrap_or(defaults.cache_sweep_cron),
        }
    }
}

fn parse_var<T: FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("${} is not a valid value ({}), defaulting to {}", name, raw, default);
            default
        }),
        Err(_) => {
            debug!("${} not set, defaulting to {}", name, default);
            default
        }
    }
}
