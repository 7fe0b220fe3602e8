// src/services/scanner.rs
use chrono::NaiveDate;
use futures::stream::{self, Stream, StreamExt};
use log::{debug, error, info};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{AnalysisResult, EarningsTiming, PriceBar, Recommendation};
use super::analyzer::{normalize_symbol, OptionsAnalyzer};
use super::cache::{CacheEntry, ResultCache};
use super::earnings_calendar::EarningsCalendar;
use super::error::{DataError, Result};
use super::market_data::{market_today, HistoryRange};

/// Progress callback, called with a percentage in `[0, 100]`.
pub type ProgressFn<'a> = &'a (dyn Fn(f64) + Send + Sync);

#[derive(Debug, Clone, Copy)]
pub struct ScannerConfig {
    pub batch_size: usize,
    pub max_workers: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig { batch_size: 10, max_workers: 5 }
    }
}

/// Where the results of a scan came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanSource {
    Fresh,
    Cached,
    Backfilled,
    NoEarnings,
    CalendarUnavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub date: NaiveDate,
    pub source: ScanSource,
    pub status: String,
    pub results: Vec<AnalysisResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanPhase {
    ResolvingSymbols,
    CheckingCache,
    ServingCache,
    Backfilling,
    Analyzing,
    Persisting,
    Done,
}

struct Progress<'a> {
    callback: Option<ProgressFn<'a>>,
    last: f64,
}

impl<'a> Progress<'a> {
    fn new(callback: Option<ProgressFn<'a>>) -> Self {
        Progress { callback, last: 0.0 }
    }

    /// Reported values never move backwards.
    fn report(&mut self, value: f64) {
        let value = value.clamp(0.0, 100.0).max(self.last);
        self.last = value;
        if let Some(callback) = self.callback {
            callback(value);
        }
    }
}

/// Scan order: Recommended first, then known timings before Unknown, then
/// timing label, then ticker.
pub fn scan_order(a: &AnalysisResult, b: &AnalysisResult) -> Ordering {
    let key = |r: &AnalysisResult| {
        (
            r.recommendation != Recommendation::Recommended,
            !r.earnings_time.is_known(),
            r.earnings_time.as_str().to_string(),
            r.ticker.clone(),
        )
    };
    key(a).cmp(&key(b))
}

pub struct EarningsScanner {
    calendar: Arc<dyn EarningsCalendar>,
    analyzer: Arc<OptionsAnalyzer>,
    cache: Arc<ResultCache>,
    config: ScannerConfig,
}

impl EarningsScanner {
    pub fn new(
        calendar: Arc<dyn EarningsCalendar>,
        analyzer: Arc<OptionsAnalyzer>,
        cache: Arc<ResultCache>,
        config: ScannerConfig,
    ) -> Self {
        let config = ScannerConfig {
            batch_size: config.batch_size.max(1),
            max_workers: config.max_workers.max(1),
        };
        EarningsScanner { calendar, analyzer, cache, config }
    }

    pub fn analyzer(&self) -> &Arc<OptionsAnalyzer> {
        &self.analyzer
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    fn enter(&self, date: NaiveDate, phase: ScanPhase) {
        debug!("Scan {}: {:?}", date, phase);
    }

    /// Single-symbol analysis outside any calendar scan.
    pub async fn analyze_one(&self, symbol: &str) -> Result<AnalysisResult> {
        let symbol = normalize_symbol(symbol).ok_or(DataError::EmptySymbol)?;
        Ok(self
            .analyzer
            .analyze_stock(&symbol, None, EarningsTiming::Unknown, market_today())
            .await)
    }

    /// Analyze every symbol reporting on `date`, reusing and completing a
    /// cached scan of the same symbol set when one exists.
    pub async fn scan(&self, date: NaiveDate, progress: Option<ProgressFn<'_>>) -> ScanReport {
        let mut progress = Progress::new(progress);
        progress.report(0.0);

        self.enter(date, ScanPhase::ResolvingSymbols);
        let announcements = match self.calendar.earnings_on(date).await {
            Ok(found) => found,
            Err(e) => {
                error!("Earnings calendar for {} unavailable: {}", date, e);
                progress.report(100.0);
                return ScanReport {
                    date,
                    source: ScanSource::CalendarUnavailable,
                    status: format!("Could not fetch earnings calendar for {}: {}", date, e),
                    results: Vec::new(),
                };
            }
        };
        if announcements.is_empty() {
            progress.report(100.0);
            return ScanReport {
                date,
                source: ScanSource::NoEarnings,
                status: format!("No stocks found with earnings on {}", date),
                results: Vec::new(),
            };
        }

        let symbols: Vec<String> = announcements.iter().map(|a| a.symbol.clone()).collect();
        let timings: HashMap<String, EarningsTiming> = announcements
            .into_iter()
            .map(|a| (a.symbol, a.timing))
            .collect();
        let today = market_today();

        self.enter(date, ScanPhase::CheckingCache);
        let report = match self.cache.lookup(date, &symbols).await {
            Some(entry) if entry.missing.is_empty() => {
                self.enter(date, ScanPhase::ServingCache);
                info!("Using cached data for {}", date);
                ScanReport {
                    date,
                    source: ScanSource::Cached,
                    status: format!("Loaded {} cached results for {}", entry.results.len(), date),
                    results: entry.results,
                }
            }
            Some(entry) => {
                self.enter(date, ScanPhase::Backfilling);
                self.backfill(date, &symbols, entry, &timings, today, &mut progress)
                    .await
            }
            None => {
                self.enter(date, ScanPhase::Analyzing);
                self.fresh_scan(date, &symbols, &timings, today, &mut progress)
                    .await
            }
        };

        progress.report(100.0);
        self.enter(date, ScanPhase::Done);
        report
    }

    async fn fresh_scan(
        &self,
        date: NaiveDate,
        symbols: &[String],
        timings: &HashMap<String, EarningsTiming>,
        today: NaiveDate,
        progress: &mut Progress<'_>,
    ) -> ScanReport {
        let total = symbols.len();
        let mut results = Vec::with_capacity(total);

        for batch in symbols.chunks(self.config.batch_size) {
            let mut analyzed = Box::pin(self.analyze_batch(batch, timings, today).await);
            while let Some(result) = analyzed.next().await {
                results.push(result);
                progress.report(results.len() as f64 / total as f64 * 80.0);
            }
        }
        results.sort_by(scan_order);

        self.enter(date, ScanPhase::Persisting);
        let mut status = format!("Scan complete. Found {} stocks.", results.len());
        match self.cache.store(date, symbols, results.clone()).await {
            Ok(entry) if !entry.missing.is_empty() => {
                status.push_str(&format!(" {} awaiting options data.", entry.missing.len()));
            }
            Ok(_) => {}
            Err(e) => error!("Could not cache scan for {}: {}", date, e),
        }

        ScanReport { date, source: ScanSource::Fresh, status, results }
    }

    async fn backfill(
        &self,
        date: NaiveDate,
        symbols: &[String],
        entry: CacheEntry,
        timings: &HashMap<String, EarningsTiming>,
        today: NaiveDate,
        progress: &mut Progress<'_>,
    ) -> ScanReport {
        let missing: Vec<String> = entry.missing.iter().map(|m| m.ticker.clone()).collect();
        let mut timings = timings.clone();
        for record in &entry.missing {
            if record.earnings_time.is_known() {
                timings.entry(record.ticker.clone()).or_insert(record.earnings_time);
            }
        }
        info!("{} cached records missing options data, attempting fill", missing.len());
        progress.report(80.0);

        let total = missing.len();
        let mut done = 0;
        let mut filled = 0;
        for batch in missing.chunks(self.config.batch_size) {
            let mut analyzed = Box::pin(self.analyze_batch(batch, &timings, today).await);
            while let Some(result) = analyzed.next().await {
                done += 1;
                progress.report(80.0 + done as f64 / total as f64 * 20.0);
                match self.cache.backfill(date, symbols, &result).await {
                    Ok(n) if n > 0 => filled += 1,
                    Ok(_) => {}
                    Err(e) => error!("Error updating cache for {}: {}", result.ticker, e),
                }
            }
        }

        let mut results = match self.cache.lookup(date, symbols).await {
            Some(updated) => updated.results,
            None => entry.results,
        };
        results.sort_by(scan_order);
        ScanReport {
            date,
            source: ScanSource::Backfilled,
            status: format!(
                "Loaded {} cached results for {} ({} of {} incomplete records updated)",
                results.len(),
                date,
                filled,
                total
            ),
            results,
        }
    }

    /// Download history for the batch in one go, then analyze each symbol on
    /// its own task with at most `max_workers` in flight. Results arrive in
    /// completion order.
    async fn analyze_batch(
        &self,
        batch: &[String],
        timings: &HashMap<String, EarningsTiming>,
        today: NaiveDate,
    ) -> impl Stream<Item = AnalysisResult> {
        let mut histories = self
            .analyzer
            .market()
            .history_batch(batch, HistoryRange::ThreeMonths)
            .await;

        let jobs: Vec<(String, Option<Vec<PriceBar>>, EarningsTiming)> = batch
            .iter()
            .map(|symbol| {
                let timing = timings.get(symbol).copied().unwrap_or(EarningsTiming::Unknown);
                (symbol.clone(), histories.remove(symbol), timing)
            })
            .collect();
        let workers = self.config.max_workers.min(jobs.len()).max(1);
        let analyzer = self.analyzer.clone();

        stream::iter(jobs)
            .map(move |(symbol, history, timing)| {
                let analyzer = analyzer.clone();
                let task_symbol = symbol.clone();
                let handle = tokio::spawn(async move {
                    analyzer.analyze_stock(&task_symbol, history, timing, today).await
                });
                async move {
                    match handle.await {
                        Ok(result) => result,
                        Err(e) => {
                            error!("Analysis task for {} failed: {}", symbol, e);
                            AnalysisResult::without_options(&symbol, timing)
                        }
                    }
                }
            })
            .buffer_unordered(workers)
    }
}
