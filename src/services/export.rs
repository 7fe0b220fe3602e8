// src/services/export.rs
use std::io::Write;

use crate::models::{AnalysisResult, EarningsTiming, Recommendation};

pub const HEADINGS: [&str; 15] = [
    "Ticker",
    "Price",
    "Market Cap",
    "Volume 1d",
    "Avg Vol Check",
    "30D Volume",
    "Earnings Time",
    "Recommendation",
    "Expected Move",
    "ATR 14d",
    "IV30/RV30",
    "Term Slope",
    "Term Structure",
    "Historical Vol",
    "Current IV",
];

const NOT_AVAILABLE: &str = "N/A";

/// Filter on earnings timing and recommendation; `None` matches everything.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResultFilter {
    pub earnings_time: Option<EarningsTiming>,
    pub recommendation: Option<Recommendation>,
}

impl ResultFilter {
    /// Parse query values, where a missing value or "All" means no filter.
    pub fn from_params(earnings_time: Option<&str>, recommendation: Option<&str>) -> Result<Self, String> {
        fn parse<T: std::str::FromStr<Err = String>>(raw: Option<&str>) -> Result<Option<T>, String> {
            match raw.map(str::trim) {
                None | Some("") | Some("All") => Ok(None),
                Some(value) => value.parse().map(Some),
            }
        }
        Ok(ResultFilter {
            earnings_time: parse(earnings_time)?,
            recommendation: parse(recommendation)?,
        })
    }

    pub fn matches(&self, result: &AnalysisResult) -> bool {
        self.earnings_time.map_or(true, |t| result.earnings_time == t)
            && self.recommendation.map_or(true, |r| result.recommendation == r)
    }

    pub fn apply(&self, results: &[AnalysisResult]) -> Vec<AnalysisResult> {
        results.iter().filter(|r| self.matches(r)).cloned().collect()
    }
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    grouped
}

fn percent(value: f64) -> String {
    format!("{:.2}%", value * 100.0)
}

fn or_na<T>(value: Option<T>, render: impl FnOnce(T) -> String) -> String {
    value.map_or_else(|| NOT_AVAILABLE.to_string(), render)
}

/// Display strings for one result, in `HEADINGS` order.
pub fn row_values(r: &AnalysisResult) -> Vec<String> {
    vec![
        r.ticker.clone(),
        format!("${:.2}", r.current_price),
        or_na(r.market_cap.filter(|c| *c > 0), |c| format!("${}", group_thousands(c))),
        or_na(Some(r.volume).filter(|v| *v > 0), group_thousands),
        if r.avg_volume { "PASS" } else { "FAIL" }.to_string(),
        or_na(Some(r.avg_volume_value).filter(|v| *v > 0.0), |v| group_thousands(v as u64)),
        r.earnings_time.to_string(),
        r.recommendation.to_string(),
        or_na(r.expected_move, |m| format!("{}%", m)),
        format!("{:.2}", r.atr14),
        or_na(r.iv30_rv30, |v| format!("{:.2}", v)),
        or_na(r.term_slope, |v| format!("{:.4}", v)),
        or_na(r.term_structure.filter(|v| *v != 0.0), percent),
        percent(r.historical_volatility),
        or_na(r.current_iv.filter(|v| *v != 0.0), percent),
    ]
}

/// Write a header row and one formatted row per result.
pub fn write_csv<W: Write>(writer: W, results: &[AnalysisResult]) -> Result<(), csv::Error> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(HEADINGS)?;
    for result in results {
        wtr.write_record(row_values(result))?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn to_csv_string(results: &[AnalysisResult]) -> Result<String, csv::Error> {
    let mut buffer = Vec::new();
    write_csv(&mut buffer, results)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
