// src/services/cache.rs
use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;

use crate::models::{AnalysisResult, MissingRecord};
use super::error::CacheError;
use super::volatility::score;

/// One persisted scan: the results for a date and symbol set, plus the
/// records still waiting on options data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub cache_key: String,
    pub timestamp: DateTime<Utc>,
    pub date: NaiveDate,
    pub symbols: Vec<String>,
    pub results: Vec<AnalysisResult>,
    pub missing: Vec<MissingRecord>,
}

fn normalized(symbols: &[String]) -> Vec<String> {
    let mut symbols = symbols.to_vec();
    symbols.sort();
    symbols.dedup();
    symbols
}

/// Order-insensitive key for a date and symbol set.
pub fn cache_key(date: NaiveDate, symbols: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}_{}", date.format("%Y-%m-%d"), normalized(symbols).join("_")));
    hex::encode(hasher.finalize())
}

pub fn identify_missing(results: &[AnalysisResult]) -> Vec<MissingRecord> {
    results
        .iter()
        .filter_map(|r| {
            let missing_fields = r.missing_fields();
            if missing_fields.is_empty() {
                None
            } else {
                Some(MissingRecord {
                    ticker: r.ticker.clone(),
                    missing_fields,
                    earnings_time: r.earnings_time,
                })
            }
        })
        .collect()
}

/// Copy fields absent in `stored` from `update`. Present values are never
/// replaced. Returns how many fields were filled.
pub fn merge_missing(stored: &mut AnalysisResult, update: &AnalysisResult) -> usize {
    fn fill<T: Copy>(slot: &mut Option<T>, value: Option<T>, filled: &mut usize) {
        if slot.is_none() && value.is_some() {
            *slot = value;
            *filled += 1;
        }
    }

    let mut filled = 0;
    fill(&mut stored.expected_move, update.expected_move, &mut filled);
    fill(&mut stored.current_iv, update.current_iv, &mut filled);
    fill(&mut stored.term_structure, update.term_structure, &mut filled);
    fill(&mut stored.iv30_rv30, update.iv30_rv30, &mut filled);
    fill(&mut stored.term_slope, update.term_slope, &mut filled);
    fill(&mut stored.market_cap, update.market_cap, &mut filled);

    if !stored.earnings_time.is_known() && update.earnings_time.is_known() {
        stored.earnings_time = update.earnings_time;
        filled += 1;
    }

    // A zero price means the first run never got price history.
    if stored.current_price == 0.0 && update.current_price > 0.0 {
        stored.current_price = update.current_price;
        stored.volume = update.volume;
        stored.avg_volume = update.avg_volume;
        stored.avg_volume_value = update.avg_volume_value;
        stored.atr14 = update.atr14;
        stored.historical_volatility = update.historical_volatility;
        filled += 1;
    }

    if let (Some(ratio), Some(slope)) = (stored.iv30_rv30, stored.term_slope) {
        stored.recommendation = score(stored.avg_volume, ratio, slope);
    }
    filled
}

/// Scan results persisted as one JSON file per key. Reads and writes for
/// the same key are serialized; different keys proceed independently.
pub struct ResultCache {
    dir: PathBuf,
    retention: Duration,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ResultCache {
    pub async fn open(dir: impl Into<PathBuf>, retention_days: i64) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(ResultCache {
            dir,
            retention: Duration::days(retention_days),
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// Lock for `key`. Locks nobody else holds are dropped from the map on
    /// the way in, so it only tracks keys with work in flight.
    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(key.to_string()).or_default().clone()
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        Utc::now() - entry.timestamp > self.retention
    }

    /// The live entry for `date` and `symbols`. Expired and unreadable
    /// entries are deleted and reported as absent.
    pub async fn lookup(&self, date: NaiveDate, symbols: &[String]) -> Option<CacheEntry> {
        let key = cache_key(date, symbols);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;
        self.read_live(&key).await
    }

    async fn read_live(&self, key: &str) -> Option<CacheEntry> {
        let path = self.entry_path(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                error!("Error reading cache {}: {}", path.display(), e);
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                error!("Discarding unreadable cache {}: {}", path.display(), e);
                remove_quietly(&path).await;
                return None;
            }
        };

        if self.is_expired(&entry) {
            info!("Cache {} expired", key);
            remove_quietly(&path).await;
            return None;
        }
        Some(entry)
    }

    pub async fn store(
        &self,
        date: NaiveDate,
        symbols: &[String],
        results: Vec<AnalysisResult>,
    ) -> Result<CacheEntry, CacheError> {
        let key = cache_key(date, symbols);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        let entry = CacheEntry {
            cache_key: key,
            timestamp: Utc::now(),
            date,
            symbols: normalized(symbols),
            missing: identify_missing(&results),
            results,
        };
        self.write(&entry).await?;

        if entry.missing.is_empty() {
            info!("Saved {} results for {}", entry.results.len(), date);
        } else {
            info!(
                "Saved {} results for {} with {} missing",
                entry.results.len(),
                date,
                entry.missing.len()
            );
        }
        Ok(entry)
    }

    /// Merge a freshly computed record into the stored one and rewrite the
    /// entry with a recomputed missing list. Returns the number of fields filled.
    pub async fn backfill(
        &self,
        date: NaiveDate,
        symbols: &[String],
        update: &AnalysisResult,
    ) -> Result<usize, CacheError> {
        let key = cache_key(date, symbols);
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        let mut entry = self
            .read_live(&key)
            .await
            .ok_or_else(|| CacheError::NotFound(key.clone()))?;
        let stored = match entry.results.iter_mut().find(|r| r.ticker == update.ticker) {
            Some(stored) => stored,
            None => {
                debug!("{} not part of cache {}, nothing to backfill", update.ticker, key);
                return Ok(0);
            }
        };

        let filled = merge_missing(stored, update);
        if filled > 0 {
            entry.missing = identify_missing(&entry.results);
            self.write(&entry).await?;
            info!("Updated cache for {} ({} fields)", update.ticker, filled);
        }
        Ok(filled)
    }

    /// Delete every expired or unreadable entry. Returns how many were removed.
    pub async fn clear_expired(&self) -> usize {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) => {
                error!("Cannot list cache directory {}: {}", self.dir.display(), e);
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let item = match dir.next_entry().await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) => {
                    error!("Error walking cache directory: {}", e);
                    break;
                }
            };
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let key = match path.file_stem().and_then(|s| s.to_str()) {
                Some(key) => key.to_string(),
                None => continue,
            };

            let lock = self.key_lock(&key);
            let _guard = lock.lock().await;
            let stale = match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<CacheEntry>(&bytes) {
                    Ok(entry) => self.is_expired(&entry),
                    Err(_) => true,
                },
                Err(_) => false,
            };
            if stale {
                remove_quietly(&path).await;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Removed {} expired cache entries", removed);
        }
        removed
    }

    async fn write(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let path = self.entry_path(&entry.cache_key);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(entry)?;
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            error!("Could not remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EarningsTiming, MissingField, Recommendation};
    use tempfile::TempDir;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn complete(ticker: &str) -> AnalysisResult {
        AnalysisResult {
            ticker: ticker.to_string(),
            current_price: 50.0,
            market_cap: Some(1_000_000_000),
            volume: 2_000_000,
            avg_volume: true,
            avg_volume_value: 1_800_000.0,
            earnings_time: EarningsTiming::PreMarket,
            recommendation: Recommendation::Recommended,
            expected_move: Some(6.5),
            atr14: 1.2,
            iv30_rv30: Some(1.6),
            term_slope: Some(-0.01),
            term_structure: Some(0.45),
            historical_volatility: 0.28,
            current_iv: Some(0.32),
        }
    }

    async fn cache() -> (TempDir, ResultCache) {
        let dir = TempDir::new().unwrap();
        let cache = ResultCache::open(dir.path().join("stock_cache"), 7).await.unwrap();
        (dir, cache)
    }

    #[test]
    fn key_ignores_symbol_order_and_duplicates() {
        let a = cache_key(day(), &symbols(&["MSFT", "AAPL"]));
        let b = cache_key(day(), &symbols(&["AAPL", "MSFT", "AAPL"]));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, cache_key(day().succ_opt().unwrap(), &symbols(&["AAPL", "MSFT"])));
    }

    #[test]
    fn merge_fills_only_absent_fields() {
        let mut stored = complete("AAA");
        stored.expected_move = None;
        let mut update = AnalysisResult::without_options("AAA", EarningsTiming::Unknown);
        update.expected_move = Some(7.25);

        assert_eq!(merge_missing(&mut stored, &update), 1);
        assert_eq!(stored.expected_move, Some(7.25));
        assert_eq!(stored.current_iv, Some(0.32));
        assert_eq!(stored.earnings_time, EarningsTiming::PreMarket);
        assert_eq!(stored.recommendation, Recommendation::Recommended);
    }

    #[test]
    fn merge_rescores_once_signals_arrive() {
        let mut stored = AnalysisResult::without_options("AAA", EarningsTiming::PostMarket);
        stored.current_price = 50.0;
        stored.avg_volume = true;
        let update = complete("AAA");

        merge_missing(&mut stored, &update);
        assert_eq!(stored.recommendation, Recommendation::Recommended);
        assert!(stored.missing_fields().is_empty());
        assert_eq!(stored.earnings_time, EarningsTiming::PostMarket);
    }

    #[tokio::test]
    async fn store_then_lookup() {
        let (_dir, cache) = cache().await;
        let mut partial = complete("BBB");
        partial.current_iv = None;
        let results = vec![complete("AAA"), partial];

        let stored = cache
            .store(day(), &symbols(&["BBB", "AAA"]), results.clone())
            .await
            .unwrap();
        assert_eq!(stored.missing.len(), 1);
        assert_eq!(stored.missing[0].ticker, "BBB");
        assert_eq!(stored.missing[0].missing_fields, vec![MissingField::CurrentIv]);

        let found = cache.lookup(day(), &symbols(&["AAA", "BBB"])).await.unwrap();
        assert_eq!(found.results, results);
        assert_eq!(found.symbols, symbols(&["AAA", "BBB"]));
    }

    #[tokio::test]
    async fn backfill_never_regresses_present_values() {
        let (_dir, cache) = cache().await;
        let mut partial = complete("AAA");
        partial.expected_move = None;
        let list = symbols(&["AAA"]);
        cache.store(day(), &list, vec![partial]).await.unwrap();

        let mut update = AnalysisResult::without_options("AAA", EarningsTiming::Unknown);
        update.expected_move = Some(5.5);
        assert_eq!(cache.backfill(day(), &list, &update).await.unwrap(), 1);

        let found = cache.lookup(day(), &list).await.unwrap();
        assert_eq!(found.results[0].expected_move, Some(5.5));
        assert_eq!(found.results[0].current_iv, Some(0.32));
        assert!(found.missing.is_empty());
    }

    #[tokio::test]
    async fn backfill_without_entry_is_not_found() {
        let (_dir, cache) = cache().await;
        let outcome = cache
            .backfill(day(), &symbols(&["AAA"]), &complete("AAA"))
            .await;
        assert!(matches!(outcome, Err(CacheError::NotFound(_))));
    }

    #[tokio::test]
    async fn expired_entries_are_dropped_on_lookup() {
        let (_dir, cache) = cache().await;
        let list = symbols(&["AAA"]);
        let entry = CacheEntry {
            cache_key: cache_key(day(), &list),
            timestamp: Utc::now() - Duration::days(8),
            date: day(),
            symbols: list.clone(),
            results: vec![complete("AAA")],
            missing: Vec::new(),
        };
        cache.write(&entry).await.unwrap();

        assert!(cache.lookup(day(), &list).await.is_none());
        assert!(!cache.entry_path(&entry.cache_key).exists());
    }

    #[tokio::test]
    async fn corrupt_entries_read_as_absent() {
        let (_dir, cache) = cache().await;
        let list = symbols(&["AAA"]);
        let path = cache.entry_path(&cache_key(day(), &list));
        std::fs::write(&path, b"{ not json").unwrap();

        assert!(cache.lookup(day(), &list).await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_entries() {
        let (_dir, cache) = cache().await;
        cache.store(day(), &symbols(&["AAA"]), vec![complete("AAA")]).await.unwrap();

        let old_symbols = symbols(&["OLD"]);
        let old = CacheEntry {
            cache_key: cache_key(day(), &old_symbols),
            timestamp: Utc::now() - Duration::days(30),
            date: day(),
            symbols: old_symbols.clone(),
            results: vec![complete("OLD")],
            missing: Vec::new(),
        };
        cache.write(&old).await.unwrap();
        std::fs::write(cache.dir().join("garbage.json"), b"[]").unwrap();

        assert_eq!(cache.clear_expired().await, 2);
        assert!(cache.lookup(day(), &symbols(&["AAA"])).await.is_some());
    }

    #[tokio::test]
    async fn concurrent_backfills_keep_every_fill() {
        let (_dir, cache) = cache().await;
        let list = symbols(&["AAA", "BBB"]);
        let mut aaa = complete("AAA");
        aaa.expected_move = None;
        let mut bbb = complete("BBB");
        bbb.current_iv = None;
        cache.store(day(), &list, vec![aaa, bbb]).await.unwrap();

        let mut aaa_update = AnalysisResult::without_options("AAA", EarningsTiming::Unknown);
        aaa_update.expected_move = Some(4.4);
        let mut bbb_update = AnalysisResult::without_options("BBB", EarningsTiming::Unknown);
        bbb_update.current_iv = Some(0.5);

        let (a, b) = tokio::join!(
            cache.backfill(day(), &list, &aaa_update),
            cache.backfill(day(), &list, &bbb_update)
        );
        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 1);

        let raw = std::fs::read(cache.entry_path(&cache_key(day(), &list))).unwrap();
        let stored: CacheEntry = serde_json::from_slice(&raw).unwrap();
        assert_eq!(stored.results[0].expected_move, Some(4.4));
        assert_eq!(stored.results[1].current_iv, Some(0.5));
        assert!(stored.missing.is_empty());
    }

    #[tokio::test]
    async fn idle_key_locks_are_pruned() {
        let (_dir, cache) = cache().await;
        for ticker in ["AAA", "BBB", "CCC"] {
            cache.store(day(), &symbols(&[ticker]), vec![complete(ticker)]).await.unwrap();
        }
        assert!(cache.lookup(day(), &symbols(&["AAA"])).await.is_some());
        assert_eq!(cache.locks.lock().unwrap().len(), 1);

        let held = cache.key_lock("held");
        cache.key_lock("other");
        assert_eq!(cache.locks.lock().unwrap().len(), 2);
        drop(held);
        cache.key_lock("third");
        assert_eq!(cache.locks.lock().unwrap().len(), 1);
    }
}
