// src/services/analyzer.rs
use chrono::NaiveDate;
use futures::future::try_join_all;
use log::{debug, info, warn};
use std::sync::Arc;

use crate::models::{AnalysisResult, EarningsTiming, OptionQuote, PriceBar};
use super::error::{DataError, Result};
use super::market_data::{usable_expirations, HistoryRange, MarketData};
use super::volatility::{
    average_true_range, average_volume, iv_rv_ratio, score, term_slope, TermStructure,
    VolatilityEngine, ATR_PERIOD, AVG_VOLUME_THRESHOLD, AVG_VOLUME_WINDOW, RV_WINDOW,
    TRADING_PERIODS,
};

/// Everything derived from one symbol's option chains and price history.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionMetrics {
    pub avg_volume_ok: bool,
    pub avg_volume_value: f64,
    pub iv30_rv30: f64,
    pub term_slope: f64,
    pub iv30: f64,
    pub expected_move: Option<f64>,
    pub underlying_price: f64,
    pub historical_volatility: f64,
    pub current_iv: f64,
    pub atr14: f64,
    pub market_cap: Option<u64>,
    pub volume: u64,
}

/// Trimmed, upper-cased symbol, or `None` when nothing is left.
pub fn normalize_symbol(raw: &str) -> Option<String> {
    let symbol = raw.trim().to_uppercase();
    if symbol.is_empty() {
        None
    } else {
        Some(symbol)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// The quote whose strike is closest to `price`; ties go to the first listed.
fn nearest_strike(quotes: &[OptionQuote], price: f64) -> Option<&OptionQuote> {
    quotes
        .iter()
        .filter(|q| q.implied_volatility.is_finite())
        .min_by(|a, b| {
            (a.strike - price)
                .abs()
                .total_cmp(&(b.strike - price).abs())
        })
}

pub struct OptionsAnalyzer {
    market: Arc<dyn MarketData>,
    engine: VolatilityEngine,
}

impl OptionsAnalyzer {
    pub fn new(market: Arc<dyn MarketData>) -> Self {
        OptionsAnalyzer { market, engine: VolatilityEngine::new() }
    }

    pub fn market(&self) -> &Arc<dyn MarketData> {
        &self.market
    }

    pub fn engine(&self) -> &VolatilityEngine {
        &self.engine
    }

    /// Build the IV term structure from every usable expiry and score the
    /// symbol. `history` is reused when the caller already downloaded it.
    pub async fn compute_recommendation(
        &self,
        symbol: &str,
        history: Option<&[PriceBar]>,
        today: NaiveDate,
    ) -> Result<OptionMetrics> {
        let symbol = normalize_symbol(symbol).ok_or(DataError::EmptySymbol)?;

        let quote = self.market.quote(&symbol).await?;
        if quote.expirations.is_empty() {
            return Err(DataError::NoOptions(symbol));
        }
        let expirations = usable_expirations(&quote.expirations, today)?;

        let fetched;
        let bars: &[PriceBar] = match history {
            Some(bars) if !bars.is_empty() => bars,
            _ => {
                fetched = self.market.history(&symbol, HistoryRange::ThreeMonths).await?;
                &fetched
            }
        };
        let last_bar = bars.last().ok_or_else(|| DataError::EmptyHistory(symbol.clone()))?;
        // Strikes are matched against the live market price; the last close
        // stands in only when the quote carries none.
        let underlying = if quote.price > 0.0 { quote.price } else { last_bar.close };

        let chains = try_join_all(
            expirations
                .iter()
                .map(|exp| self.market.option_chain(&symbol, *exp)),
        )
        .await?;

        let mut days = Vec::with_capacity(chains.len());
        let mut ivs = Vec::with_capacity(chains.len());
        let mut nearest: Option<(f64, Option<f64>)> = None;
        for chain in &chains {
            let (call, put) = match (
                nearest_strike(&chain.calls, underlying),
                nearest_strike(&chain.puts, underlying),
            ) {
                (Some(call), Some(put)) => (call, put),
                _ => {
                    debug!("{}: empty chain for {}, skipping", symbol, chain.expiration);
                    continue;
                }
            };

            let atm_iv = (call.implied_volatility + put.implied_volatility) / 2.0;
            days.push((chain.expiration - today).num_days());
            ivs.push(atm_iv);

            if nearest.is_none() {
                let straddle = match (call.mid(), put.mid()) {
                    (Some(c), Some(p)) => Some(c + p),
                    _ => None,
                };
                nearest = Some((atm_iv, straddle));
            }
        }

        let (current_iv, straddle) = nearest.ok_or(DataError::NoAtmIv)?;
        let structure = TermStructure::build(&days, &ivs);
        let iv30 = structure.iv_at(30.0).ok_or(DataError::NoAtmIv)?;
        let nearest_days = days.iter().copied().min().ok_or(DataError::NoAtmIv)?;
        let slope = term_slope(&structure, nearest_days).ok_or(DataError::NoAtmIv)?;

        let realized = self
            .engine
            .realized_volatility(bars, RV_WINDOW, TRADING_PERIODS)
            .ok_or_else(|| DataError::InsufficientHistory(symbol.clone()))?;
        let avg_volume_value = average_volume(bars, AVG_VOLUME_WINDOW).unwrap_or(0.0);

        let metrics = OptionMetrics {
            avg_volume_ok: avg_volume_value >= AVG_VOLUME_THRESHOLD,
            avg_volume_value,
            iv30_rv30: iv_rv_ratio(iv30, realized),
            term_slope: slope,
            iv30,
            expected_move: straddle.map(|s| round2(s / underlying * 100.0)),
            underlying_price: underlying,
            historical_volatility: realized,
            current_iv,
            atr14: average_true_range(bars, ATR_PERIOD).unwrap_or(0.0),
            market_cap: quote.market_cap,
            volume: quote.volume.unwrap_or(last_bar.volume),
        };
        debug!("{}: {:?}", symbol, metrics);
        Ok(metrics)
    }

    /// Full record for one symbol. Never fails: when the options side cannot
    /// be computed the record carries price-history fields only and is
    /// marked Avoid.
    pub async fn analyze_stock(
        &self,
        symbol: &str,
        history: Option<Vec<PriceBar>>,
        earnings_time: EarningsTiming,
        today: NaiveDate,
    ) -> AnalysisResult {
        let ticker = normalize_symbol(symbol).unwrap_or_else(|| symbol.to_string());
        let fetched = match history {
            Some(bars) if !bars.is_empty() => Ok(bars),
            _ => self.market.history(&ticker, HistoryRange::ThreeMonths).await,
        };
        // Realized volatility needs these bars; without them the options side is skipped.
        let bars = match fetched {
            Ok(bars) if !bars.is_empty() => bars,
            Ok(_) => {
                warn!("No price history for {}", ticker);
                return AnalysisResult::without_options(&ticker, earnings_time);
            }
            Err(e) => {
                warn!("No price history for {}: {}", ticker, e);
                return AnalysisResult::without_options(&ticker, earnings_time);
            }
        };

        match self.compute_recommendation(&ticker, Some(&bars), today).await {
            Ok(metrics) => AnalysisResult {
                ticker,
                current_price: bars.last().map_or(metrics.underlying_price, |b| b.close),
                market_cap: metrics.market_cap,
                volume: metrics.volume,
                avg_volume: metrics.avg_volume_ok,
                avg_volume_value: metrics.avg_volume_value,
                earnings_time,
                recommendation: score(metrics.avg_volume_ok, metrics.iv30_rv30, metrics.term_slope),
                expected_move: metrics.expected_move,
                atr14: metrics.atr14,
                iv30_rv30: Some(metrics.iv30_rv30),
                term_slope: Some(metrics.term_slope),
                term_structure: Some(metrics.iv30),
                historical_volatility: metrics.historical_volatility,
                current_iv: Some(metrics.current_iv),
            },
            Err(e) => {
                info!("Options analysis for {} unavailable: {}", ticker, e);
                self.history_only(&ticker, &bars, earnings_time)
            }
        }
    }

    fn history_only(&self, ticker: &str, bars: &[PriceBar], earnings_time: EarningsTiming) -> AnalysisResult {
        let mut record = AnalysisResult::without_options(ticker, earnings_time);
        if let Some(last) = bars.last() {
            record.current_price = last.close;
            record.volume = last.volume;
        }
        record.avg_volume_value = average_volume(bars, AVG_VOLUME_WINDOW).unwrap_or(0.0);
        record.avg_volume = record.avg_volume_value >= AVG_VOLUME_THRESHOLD;
        record.atr14 = average_true_range(bars, ATR_PERIOD).unwrap_or(0.0);
        record.historical_volatility = self
            .engine
            .realized_volatility(bars, RV_WINDOW, TRADING_PERIODS)
            .unwrap_or(0.0);
        record
    }
}
