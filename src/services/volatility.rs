// src/services/volatility.rs
//! Realized volatility estimators, implied volatility term structure and
//! the three-signal recommendation rule.
use chrono::NaiveDate;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

use crate::models::{PriceBar, Recommendation};

pub const AVG_VOLUME_THRESHOLD: f64 = 1_500_000.0;
pub const IV_RV_THRESHOLD: f64 = 1.25;
pub const TERM_SLOPE_THRESHOLD: f64 = -0.00406;
/// Horizon, in calendar days, that the term slope is measured against.
pub const SLOPE_HORIZON_DAYS: i64 = 45;
/// Stand-in for IV30/RV30 when realized volatility is exactly zero.
pub const IV_RV_SENTINEL: f64 = 9999.0;
pub const RV_WINDOW: usize = 30;
pub const TRADING_PERIODS: f64 = 252.0;
pub const ATR_PERIOD: usize = 14;
pub const AVG_VOLUME_WINDOW: usize = 30;

#[derive(Debug, Error, PartialEq)]
pub enum EstimatorError {
    #[error("window must span at least 2 bars, got {0}")]
    WindowTooSmall(usize),

    #[error("need at least {needed} bars, got {got}")]
    InsufficientBars { needed: usize, got: usize },

    #[error("non-positive price on {0}")]
    NonPositivePrice(NaiveDate),

    #[error("estimate is not finite")]
    NonFinite,
}

/// Realized volatility estimators, evaluated top-down until one succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Estimator {
    /// Range-based Yang-Zhang. Requires `window + 1` bars with strictly
    /// positive open, high, low and close.
    YangZhang,
    /// Standard deviation of daily percent returns. Requires `window + 1`
    /// bars with non-zero closes.
    CloseToClose,
}

impl Estimator {
    pub const CHAIN: [Estimator; 2] = [Estimator::YangZhang, Estimator::CloseToClose];

    /// Annualized estimates for every full window, oldest first.
    pub fn series(
        &self,
        bars: &[PriceBar],
        window: usize,
        trading_periods: f64,
    ) -> Result<Vec<f64>, EstimatorError> {
        if window < 2 {
            return Err(EstimatorError::WindowTooSmall(window));
        }
        if bars.len() < window + 1 {
            return Err(EstimatorError::InsufficientBars { needed: window + 1, got: bars.len() });
        }
        let series = match self {
            Estimator::YangZhang => yang_zhang(bars, window, trading_periods)?,
            Estimator::CloseToClose => close_to_close(bars, window, trading_periods)?,
        };
        if series.iter().any(|v| !v.is_finite()) {
            return Err(EstimatorError::NonFinite);
        }
        Ok(series)
    }
}

fn yang_zhang(bars: &[PriceBar], window: usize, trading_periods: f64) -> Result<Vec<f64>, EstimatorError> {
    if let Some(bad) = bars
        .iter()
        .find(|b| !(b.open > 0.0 && b.high > 0.0 && b.low > 0.0 && b.close > 0.0))
    {
        return Err(EstimatorError::NonPositivePrice(bad.date));
    }

    let n = bars.len();
    let mut rs = Vec::with_capacity(n);
    // Overnight and close-to-close terms are undefined for the first bar.
    let mut open_sq = vec![0.0; n];
    let mut close_sq = vec![0.0; n];
    for (i, bar) in bars.iter().enumerate() {
        let log_ho = (bar.high / bar.open).ln();
        let log_lo = (bar.low / bar.open).ln();
        let log_co = (bar.close / bar.open).ln();
        rs.push(log_ho * (log_ho - log_co) + log_lo * (log_lo - log_co));
        if i > 0 {
            let prev_close = bars[i - 1].close;
            open_sq[i] = (bar.open / prev_close).ln().powi(2);
            close_sq[i] = (bar.close / prev_close).ln().powi(2);
        }
    }

    let w = window as f64;
    let k = 0.34 / (1.34 + (w + 1.0) / (w - 1.0));
    let norm = w - 1.0;

    Ok((window..n)
        .map(|end| {
            let span = end + 1 - window..end + 1;
            let open_vol = open_sq[span.clone()].iter().sum::<f64>() / norm;
            let close_vol = close_sq[span.clone()].iter().sum::<f64>() / norm;
            let rs_vol = rs[span].iter().sum::<f64>() / norm;
            (open_vol + k * close_vol + (1.0 - k) * rs_vol).sqrt() * trading_periods.sqrt()
        })
        .collect())
}

fn close_to_close(bars: &[PriceBar], window: usize, trading_periods: f64) -> Result<Vec<f64>, EstimatorError> {
    if let Some(bad) = bars.iter().find(|b| b.close == 0.0) {
        return Err(EstimatorError::NonPositivePrice(bad.date));
    }

    let returns: Vec<f64> = bars.windows(2).map(|w| w[1].close / w[0].close - 1.0).collect();
    Ok(returns
        .windows(window)
        .map(|span| sample_std(span) * trading_periods.sqrt())
        .collect())
}

fn sample_std(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    var.sqrt()
}

/// Runs the estimator chain. The first fallback taken by an engine is
/// logged as a warning; later ones only at debug level.
#[derive(Debug, Default)]
pub struct VolatilityEngine {
    fallback_warned: AtomicBool,
}

impl VolatilityEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent annualized realized volatility, or `None` when no
    /// estimator can handle the bars.
    pub fn realized_volatility(&self, bars: &[PriceBar], window: usize, trading_periods: f64) -> Option<f64> {
        self.estimate(bars, window, trading_periods)
            .and_then(|series| series.last().copied())
    }

    /// Every valid rolling estimate, oldest first.
    pub fn realized_volatility_series(&self, bars: &[PriceBar], window: usize, trading_periods: f64) -> Vec<f64> {
        self.estimate(bars, window, trading_periods).unwrap_or_default()
    }

    pub fn fallback_used(&self) -> bool {
        self.fallback_warned.load(Ordering::Relaxed)
    }

    fn estimate(&self, bars: &[PriceBar], window: usize, trading_periods: f64) -> Option<Vec<f64>> {
        for (i, estimator) in Estimator::CHAIN.iter().enumerate() {
            match estimator.series(bars, window, trading_periods) {
                Ok(series) => return Some(series),
                Err(e) if i + 1 < Estimator::CHAIN.len() => {
                    if !self.fallback_warned.swap(true, Ordering::Relaxed) {
                        warn!("{:?} volatility failed ({}), falling back", estimator, e);
                    } else {
                        debug!("{:?} volatility failed ({}), falling back", estimator, e);
                    }
                }
                Err(e) => debug!("{:?} volatility failed ({}), no estimate", estimator, e),
            }
        }
        None
    }
}

/// Piecewise-linear map from days-to-expiry to implied volatility. Queries
/// outside the knot range clamp to the nearest boundary value.
#[derive(Debug, Clone, PartialEq)]
pub enum TermStructure {
    Linear { days: Vec<f64>, ivs: Vec<f64> },
    /// Construction failed; every query yields `None`.
    Undefined,
}

impl TermStructure {
    pub fn build(days: &[i64], ivs: &[f64]) -> Self {
        if days.is_empty() || days.len() != ivs.len() || ivs.iter().any(|v| !v.is_finite()) {
            warn!("Error building term structure: {} days, {} ivs", days.len(), ivs.len());
            return TermStructure::Undefined;
        }

        let mut knots: Vec<(i64, f64)> = days.iter().copied().zip(ivs.iter().copied()).collect();
        knots.sort_by_key(|(d, _)| *d);
        if knots.windows(2).any(|w| w[0].0 == w[1].0) {
            warn!("Error building term structure: duplicate days-to-expiry");
            return TermStructure::Undefined;
        }

        TermStructure::Linear {
            days: knots.iter().map(|(d, _)| *d as f64).collect(),
            ivs: knots.iter().map(|(_, v)| *v).collect(),
        }
    }

    pub fn is_defined(&self) -> bool {
        matches!(self, TermStructure::Linear { .. })
    }

    pub fn iv_at(&self, dte: f64) -> Option<f64> {
        let (days, ivs) = match self {
            TermStructure::Linear { days, ivs } => (days, ivs),
            TermStructure::Undefined => return None,
        };
        if !dte.is_finite() {
            return None;
        }

        let last = days.len() - 1;
        if dte <= days[0] {
            return Some(ivs[0]);
        }
        if dte >= days[last] {
            return Some(ivs[last]);
        }

        let hi = days.partition_point(|d| *d < dte);
        if days[hi] == dte {
            return Some(ivs[hi]);
        }
        let lo = hi - 1;
        let t = (dte - days[lo]) / (days[hi] - days[lo]);
        Some(ivs[lo] + t * (ivs[hi] - ivs[lo]))
    }
}

/// IV change per day between the nearest expiry and the 45-day horizon.
pub fn term_slope(ts: &TermStructure, nearest_days: i64) -> Option<f64> {
    if nearest_days == SLOPE_HORIZON_DAYS {
        return Some(0.0);
    }
    let near = ts.iv_at(nearest_days as f64)?;
    let horizon = ts.iv_at(SLOPE_HORIZON_DAYS as f64)?;
    Some((horizon - near) / (SLOPE_HORIZON_DAYS - nearest_days) as f64)
}

pub fn iv_rv_ratio(iv30: f64, realized: f64) -> f64 {
    if realized == 0.0 {
        IV_RV_SENTINEL
    } else {
        iv30 / realized
    }
}

/// Recommended when all three signals pass; Consider when the slope passes
/// and exactly one of volume or IV/RV does; Avoid otherwise.
pub fn score(avg_volume_ok: bool, iv30_over_rv30: f64, term_slope: f64) -> Recommendation {
    let iv_ok = iv30_over_rv30 >= IV_RV_THRESHOLD;
    let slope_ok = term_slope <= TERM_SLOPE_THRESHOLD;

    if avg_volume_ok && iv_ok && slope_ok {
        Recommendation::Recommended
    } else if slope_ok && (avg_volume_ok != iv_ok) {
        Recommendation::Consider
    } else {
        Recommendation::Avoid
    }
}

/// Mean true range over the last `period` bars. The first bar has no
/// previous close, so its true range is its high-low span.
pub fn average_true_range(bars: &[PriceBar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period {
        return None;
    }
    let true_ranges: Vec<f64> = bars
        .iter()
        .enumerate()
        .map(|(i, bar)| {
            let span = bar.high - bar.low;
            match i.checked_sub(1).map(|p| bars[p].close) {
                Some(prev) => span.max((bar.high - prev).abs()).max((bar.low - prev).abs()),
                None => span,
            }
        })
        .collect();
    let tail = &true_ranges[true_ranges.len() - period..];
    Some(tail.iter().sum::<f64>() / period as f64)
}

/// Mean volume over the last `window` bars.
pub fn average_volume(bars: &[PriceBar], window: usize) -> Option<f64> {
    if window == 0 || bars.len() < window {
        return None;
    }
    let tail = &bars[bars.len() - window..];
    Some(tail.iter().map(|b| b.volume as f64).sum::<f64>() / window as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn bar(day: i64, open: f64, high: f64, low: f64, close: f64) -> PriceBar {
        PriceBar {
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(day),
            open,
            high,
            low,
            close,
            volume: 1_000_000,
        }
    }

    fn wavy_bars(n: usize) -> Vec<PriceBar> {
        (0..n)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.7).sin() * 5.0;
                bar(i as i64, base, base * 1.02, base * 0.97, base * (1.0 + 0.01 * (i as f64).cos()))
            })
            .collect()
    }

    #[test]
    fn score_matches_decision_table() {
        assert_eq!(score(true, 1.30, -0.005), Recommendation::Recommended);
        assert_eq!(score(false, 1.30, -0.005), Recommendation::Consider);
        assert_eq!(score(true, 1.00, -0.005), Recommendation::Consider);
        assert_eq!(score(true, 1.30, -0.002), Recommendation::Avoid);
        assert_eq!(score(false, 0.5, 0.01), Recommendation::Avoid);
        assert_eq!(score(false, 1.0, -0.01), Recommendation::Avoid);
    }

    #[test]
    fn score_thresholds_are_inclusive() {
        assert_eq!(score(true, IV_RV_THRESHOLD, TERM_SLOPE_THRESHOLD), Recommendation::Recommended);
    }

    #[test]
    fn yang_zhang_matches_hand_computation() {
        // Flat opens and closes, highs 10% above: only the range term contributes.
        let bars = vec![
            bar(0, 100.0, 110.0, 100.0, 100.0),
            bar(1, 100.0, 110.0, 100.0, 100.0),
            bar(2, 100.0, 110.0, 100.0, 100.0),
        ];
        let series = Estimator::YangZhang.series(&bars, 2, TRADING_PERIODS).unwrap();
        let k = 0.34 / (1.34 + 3.0);
        let expected = ((1.0 - k) * 2.0 * 1.1f64.ln().powi(2)).sqrt() * TRADING_PERIODS.sqrt();
        assert_eq!(series.len(), 1);
        assert!((series[0] - expected).abs() < 1e-12);
    }

    #[test]
    fn close_to_close_matches_hand_computation() {
        let bars = vec![
            bar(0, 100.0, 100.0, 100.0, 100.0),
            bar(1, 110.0, 110.0, 110.0, 110.0),
            bar(2, 99.0, 99.0, 99.0, 99.0),
        ];
        let series = Estimator::CloseToClose.series(&bars, 2, TRADING_PERIODS).unwrap();
        let expected = 0.02f64.sqrt() * TRADING_PERIODS.sqrt();
        assert!((series[0] - expected).abs() < 1e-9);
    }

    #[test]
    fn realized_volatility_is_finite_and_non_negative() {
        let engine = VolatilityEngine::new();
        let bars = wavy_bars(64);
        let series = engine.realized_volatility_series(&bars, RV_WINDOW, TRADING_PERIODS);
        assert_eq!(series.len(), bars.len() - RV_WINDOW);
        assert!(series.iter().all(|v| v.is_finite() && *v >= 0.0));
        assert_eq!(
            engine.realized_volatility(&bars, RV_WINDOW, TRADING_PERIODS),
            series.last().copied()
        );
        assert!(!engine.fallback_used());
    }

    #[test]
    fn constant_closes_give_zero_volatility() {
        let bars: Vec<PriceBar> = (0..31).map(|i| bar(i, 50.0, 50.0, 50.0, 50.0)).collect();
        let simple = Estimator::CloseToClose.series(&bars, RV_WINDOW, TRADING_PERIODS).unwrap();
        assert_eq!(simple, vec![0.0]);
        let engine = VolatilityEngine::new();
        assert_eq!(engine.realized_volatility(&bars, RV_WINDOW, TRADING_PERIODS), Some(0.0));
    }

    #[test]
    fn zero_open_falls_back_to_close_to_close() {
        let mut bars = wavy_bars(40);
        bars[35].open = 0.0;
        let engine = VolatilityEngine::new();
        let fallback = Estimator::CloseToClose.series(&bars, RV_WINDOW, TRADING_PERIODS).unwrap();
        assert_eq!(
            engine.realized_volatility(&bars, RV_WINDOW, TRADING_PERIODS),
            fallback.last().copied()
        );
        assert!(engine.fallback_used());
        // Second failure goes through the same path without tripping anything new.
        assert!(engine.realized_volatility(&bars, RV_WINDOW, TRADING_PERIODS).is_some());
    }

    #[test]
    fn too_few_bars_has_no_estimate() {
        let engine = VolatilityEngine::new();
        let bars = wavy_bars(RV_WINDOW);
        assert_eq!(engine.realized_volatility(&bars, RV_WINDOW, TRADING_PERIODS), None);
        assert!(engine.realized_volatility_series(&bars, RV_WINDOW, TRADING_PERIODS).is_empty());
        assert_eq!(
            Estimator::YangZhang.series(&bars, RV_WINDOW, TRADING_PERIODS),
            Err(EstimatorError::InsufficientBars { needed: 31, got: 30 })
        );
    }

    #[test]
    fn term_structure_hits_knots_exactly() {
        let ts = TermStructure::build(&[50, 8, 22], &[0.30, 0.60, 0.45]);
        assert_eq!(ts.iv_at(8.0), Some(0.60));
        assert_eq!(ts.iv_at(22.0), Some(0.45));
        assert_eq!(ts.iv_at(50.0), Some(0.30));
    }

    #[test]
    fn term_structure_clamps_outside_range() {
        let ts = TermStructure::build(&[8, 22, 50], &[0.60, 0.45, 0.30]);
        assert_eq!(ts.iv_at(1.0), Some(0.60));
        assert_eq!(ts.iv_at(-5.0), Some(0.60));
        assert_eq!(ts.iv_at(120.0), Some(0.30));
    }

    #[test]
    fn term_structure_interpolates_linearly() {
        let ts = TermStructure::build(&[10, 50], &[0.50, 0.30]);
        let iv30 = ts.iv_at(30.0).unwrap();
        assert!((iv30 - 0.40).abs() < 1e-12);
    }

    #[test]
    fn term_structure_undefined_on_bad_input() {
        assert_eq!(TermStructure::build(&[], &[]), TermStructure::Undefined);
        assert_eq!(TermStructure::build(&[10, 20], &[0.3]), TermStructure::Undefined);
        assert_eq!(TermStructure::build(&[10, 10], &[0.3, 0.4]), TermStructure::Undefined);
        assert_eq!(TermStructure::Undefined.iv_at(30.0), None);
    }

    #[test]
    fn single_knot_is_flat() {
        let ts = TermStructure::build(&[60], &[0.25]);
        assert_eq!(ts.iv_at(30.0), Some(0.25));
        assert_eq!(ts.iv_at(90.0), Some(0.25));
    }

    #[test]
    fn slope_is_zero_when_nearest_expiry_is_the_horizon() {
        let ts = TermStructure::build(&[45, 80], &[0.4, 0.3]);
        assert_eq!(term_slope(&ts, 45), Some(0.0));
    }

    #[test]
    fn slope_measures_backwardation() {
        let ts = TermStructure::build(&[5, 45], &[0.80, 0.40]);
        let slope = term_slope(&ts, 5).unwrap();
        assert!((slope - (-0.01)).abs() < 1e-12);
        assert!(score(true, 2.0, slope) == Recommendation::Recommended);
    }

    #[test]
    fn zero_realized_volatility_uses_sentinel() {
        assert_eq!(iv_rv_ratio(0.5, 0.0), IV_RV_SENTINEL);
        assert!((iv_rv_ratio(0.5, 0.25) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn atr_uses_previous_close() {
        let bars = vec![
            bar(0, 10.0, 12.0, 9.0, 11.0),  // 3
            bar(1, 11.0, 11.5, 10.5, 11.0), // max(1, 0.5, 0.5) = 1
            bar(2, 13.0, 14.0, 12.5, 13.5), // max(1.5, 3, 1.5) = 3
        ];
        assert_eq!(average_true_range(&bars, 3), Some(7.0 / 3.0));
        assert_eq!(average_true_range(&bars, 2), Some(2.0));
        assert_eq!(average_true_range(&bars, 4), None);
    }

    #[test]
    fn average_volume_uses_trailing_window() {
        let mut bars = wavy_bars(35);
        for (i, b) in bars.iter_mut().enumerate() {
            b.volume = if i < 5 { 0 } else { 2_000_000 };
        }
        assert_eq!(average_volume(&bars, AVG_VOLUME_WINDOW), Some(2_000_000.0));
        assert_eq!(average_volume(&bars[..10], AVG_VOLUME_WINDOW), None);
    }
}
