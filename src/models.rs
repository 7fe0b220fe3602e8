// src/models.rs
use serde::{Serialize, Deserialize};
use chrono::NaiveDate;
use std::fmt;

/// One daily OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionQuote {
    pub strike: f64,
    pub bid: f64,
    pub ask: f64,
    pub implied_volatility: f64,
}

impl OptionQuote {
    /// Mid price, only when both sides of the market are quoted.
    pub fn mid(&self) -> Option<f64> {
        if self.bid > 0.0 && self.ask > 0.0 {
            Some((self.bid + self.ask) / 2.0)
        } else {
            None
        }
    }
}

/// Calls and puts for a single expiration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionChain {
    pub expiration: NaiveDate,
    pub calls: Vec<OptionQuote>,
    pub puts: Vec<OptionQuote>,
}

/// Underlying quote plus the listed expirations for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteSummary {
    pub symbol: String,
    pub price: f64,
    pub market_cap: Option<u64>,
    pub volume: Option<u64>,
    pub expirations: Vec<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recommendation {
    Recommended,
    Consider,
    Avoid,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Recommended => "Recommended",
            Recommendation::Consider => "Consider",
            Recommendation::Avoid => "Avoid",
        }
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Recommendation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Recommended" => Ok(Recommendation::Recommended),
            "Consider" => Ok(Recommendation::Consider),
            "Avoid" => Ok(Recommendation::Avoid),
            other => Err(format!("unknown recommendation '{}'", other)),
        }
    }
}

/// When a company reports relative to the regular session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EarningsTiming {
    #[serde(rename = "Pre Market")]
    PreMarket,
    #[serde(rename = "Post Market")]
    PostMarket,
    #[serde(rename = "During Market")]
    DuringMarket,
    Unknown,
}

impl EarningsTiming {
    pub fn as_str(&self) -> &'static str {
        match self {
            EarningsTiming::PreMarket => "Pre Market",
            EarningsTiming::PostMarket => "Post Market",
            EarningsTiming::DuringMarket => "During Market",
            EarningsTiming::Unknown => "Unknown",
        }
    }

    pub fn is_known(&self) -> bool {
        *self != EarningsTiming::Unknown
    }
}

impl fmt::Display for EarningsTiming {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EarningsTiming {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pre Market" => Ok(EarningsTiming::PreMarket),
            "Post Market" => Ok(EarningsTiming::PostMarket),
            "During Market" => Ok(EarningsTiming::DuringMarket),
            "Unknown" => Ok(EarningsTiming::Unknown),
            other => Err(format!("unknown earnings time '{}'", other)),
        }
    }
}

/// A symbol reporting on a given calendar date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarningsAnnouncement {
    pub symbol: String,
    pub timing: EarningsTiming,
}

/// Fields whose absence marks a cached result as incomplete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingField {
    ExpectedMove,
    CurrentIv,
    TermStructure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingRecord {
    pub ticker: String,
    pub missing_fields: Vec<MissingField>,
    pub earnings_time: EarningsTiming,
}

/// Per-symbol scan output, persisted in the result cache.
///
/// Options-derived values that could not be computed are `None` and are
/// always serialized (as `null`), so an incomplete record can be told apart
/// from one whose value is legitimately zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub ticker: String,
    pub current_price: f64,
    pub market_cap: Option<u64>,
    pub volume: u64,
    pub avg_volume: bool,
    pub avg_volume_value: f64,
    pub earnings_time: EarningsTiming,
    pub recommendation: Recommendation,
    /// Straddle price as a percent of the underlying.
    pub expected_move: Option<f64>,
    pub atr14: f64,
    pub iv30_rv30: Option<f64>,
    pub term_slope: Option<f64>,
    /// Interpolated 30-day implied volatility.
    pub term_structure: Option<f64>,
    pub historical_volatility: f64,
    /// ATM implied volatility of the nearest usable expiration.
    pub current_iv: Option<f64>,
}

impl AnalysisResult {
    /// Record for a symbol with no option data: price-history fields only.
    pub fn without_options(ticker: &str, earnings_time: EarningsTiming) -> Self {
        AnalysisResult {
            ticker: ticker.to_string(),
            current_price: 0.0,
            market_cap: None,
            volume: 0,
            avg_volume: false,
            avg_volume_value: 0.0,
            earnings_time,
            recommendation: Recommendation::Avoid,
            expected_move: None,
            atr14: 0.0,
            iv30_rv30: None,
            term_slope: None,
            term_structure: None,
            historical_volatility: 0.0,
            current_iv: None,
        }
    }

    pub fn is_present(&self, field: MissingField) -> bool {
        match field {
            MissingField::ExpectedMove => self.expected_move.is_some(),
            MissingField::CurrentIv => self.current_iv.is_some(),
            MissingField::TermStructure => self.term_structure.is_some(),
        }
    }

    pub fn missing_fields(&self) -> Vec<MissingField> {
        [MissingField::ExpectedMove, MissingField::CurrentIv, MissingField::TermStructure]
            .into_iter()
            .filter(|f| !self.is_present(*f))
            .collect()
    }
}
