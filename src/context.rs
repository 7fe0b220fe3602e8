// src/context.rs
use anyhow::Context;
use log::info;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::services::analyzer::OptionsAnalyzer;
use crate::services::cache::ResultCache;
use crate::services::earnings_calendar::{EarningsCalendar, InvestingCalendar};
use crate::services::market_data::{MarketData, YahooGateway};
use crate::services::proxy::ProxyPool;
use crate::services::scanner::{EarningsScanner, ScannerConfig};
use crate::services::session::NetworkSession;

/// Shared services behind the HTTP routes, background jobs and binaries.
pub struct AppContext {
    pub config: AppConfig,
    pub proxies: Arc<ProxyPool>,
    pub market: Arc<dyn MarketData>,
    pub cache: Arc<ResultCache>,
    pub scanner: Arc<EarningsScanner>,
}

impl AppContext {
    pub async fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let proxies = Arc::new(ProxyPool::new(config.proxy_enabled));
        let timeout = Duration::from_secs(config.request_timeout_secs);

        // Market data and the calendar keep separate sessions over one pool.
        let market_session = Arc::new(NetworkSession::new(proxies.clone(), timeout, config.max_attempts));
        let calendar_session = Arc::new(NetworkSession::new(proxies.clone(), timeout, config.max_attempts));

        let market: Arc<dyn MarketData> =
            Arc::new(YahooGateway::new(market_session, config.yahoo_base_url.clone()));
        let calendar: Arc<dyn EarningsCalendar> =
            Arc::new(InvestingCalendar::new(calendar_session, config.calendar_url.clone()));

        let cache = Arc::new(
            ResultCache::open(&config.cache_dir, config.cache_retention_days)
                .await
                .with_context(|| format!("opening cache directory {}", config.cache_dir.display()))?,
        );
        info!("Result cache at {}", config.cache_dir.display());

        let analyzer = Arc::new(OptionsAnalyzer::new(market.clone()));
        let scanner = Arc::new(EarningsScanner::new(
            calendar,
            analyzer,
            cache.clone(),
            ScannerConfig {
                batch_size: config.batch_size,
                max_workers: config.max_workers,
            },
        ));

        Ok(AppContext { config, proxies, market, cache, scanner })
    }
}
