// src/services/market_data.rs
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::US::Eastern;
use futures::future::join_all;
use log::{error, info};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{OptionChain, OptionQuote, PriceBar, QuoteSummary};
use super::error::{DataError, Result};
use super::session::{checked_text, NetworkSession};
use super::volatility::SLOPE_HORIZON_DAYS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryRange {
    OneDay,
    ThreeMonths,
    OneYear,
}

impl HistoryRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryRange::OneDay => "1d",
            HistoryRange::ThreeMonths => "3mo",
            HistoryRange::OneYear => "1y",
        }
    }
}

/// Price history and option chains for a symbol.
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn history(&self, symbol: &str, range: HistoryRange) -> Result<Vec<PriceBar>>;

    async fn quote(&self, symbol: &str) -> Result<QuoteSummary>;

    async fn option_chain(&self, symbol: &str, expiration: NaiveDate) -> Result<OptionChain>;

    /// History for several symbols in one go. Symbols that fail or come back
    /// empty are left out of the map.
    async fn history_batch(&self, symbols: &[String], range: HistoryRange) -> HashMap<String, Vec<PriceBar>> {
        let fetches = symbols
            .iter()
            .map(|symbol| async move { (symbol.clone(), self.history(symbol, range).await) });

        join_all(fetches)
            .await
            .into_iter()
            .filter_map(|(symbol, outcome)| match outcome {
                Ok(bars) if !bars.is_empty() => Some((symbol, bars)),
                Ok(_) => None,
                Err(e) => {
                    error!("batch download error for {}: {}", symbol, e);
                    None
                }
            })
            .collect()
    }
}

/// Today's date on the US equity market clock.
pub fn market_today() -> NaiveDate {
    Utc::now().with_timezone(&Eastern).date_naive()
}

/// Every listed expiry up to and including the first one at least 45 days
/// out, minus a same-day expiry.
pub fn usable_expirations(expirations: &[NaiveDate], today: NaiveDate) -> Result<Vec<NaiveDate>> {
    let cutoff = today + Duration::days(SLOPE_HORIZON_DAYS);
    let mut sorted = expirations.to_vec();
    sorted.sort();
    sorted.dedup();

    let horizon = sorted
        .iter()
        .position(|d| *d >= cutoff)
        .ok_or(DataError::NoValidExpiration)?;

    let mut usable = sorted[..=horizon].to_vec();
    if usable.first() == Some(&today) {
        usable.remove(0);
    }
    Ok(usable)
}

pub struct YahooGateway {
    session: Arc<NetworkSession>,
    base_url: String,
}

impl YahooGateway {
    pub fn new(session: Arc<NetworkSession>, base_url: impl Into<String>) -> Self {
        YahooGateway {
            session,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn session(&self) -> &Arc<NetworkSession> {
        &self.session
    }

    async fn fetch_options(&self, symbol: &str, expiration: Option<NaiveDate>) -> Result<OptionsResult> {
        let url = format!("{}/v7/finance/options/{}", self.base_url, symbol);
        let url = url.as_str();
        let date_param = expiration.and_then(expiry_timestamp).map(|ts| ts.to_string());
        let date_param = date_param.as_deref();

        self.session
            .with_retry(&format!("{} options", symbol), move |client| async move {
                let mut request = client.get(url);
                if let Some(date) = date_param {
                    request = request.query(&[("date", date)]);
                }
                let resp = request.send().await?;
                if resp.status() == StatusCode::NOT_FOUND {
                    return Err(DataError::NoOptions(symbol.to_string()));
                }
                let body = checked_text(resp).await?;
                parse_options(symbol, &body)
            })
            .await
    }
}

#[async_trait]
impl MarketData for YahooGateway {
    async fn history(&self, symbol: &str, range: HistoryRange) -> Result<Vec<PriceBar>> {
        let url = format!("{}/v8/finance/chart/{}", self.base_url, symbol);
        let url = url.as_str();

        self.session
            .with_retry(&format!("{} history", symbol), move |client| async move {
                let resp = client
                    .get(url)
                    .query(&[("range", range.as_str()), ("interval", "1d")])
                    .send()
                    .await?;
                if resp.status() == StatusCode::NOT_FOUND {
                    return Err(DataError::EmptyHistory(symbol.to_string()));
                }
                let body = checked_text(resp).await?;
                parse_chart(symbol, &body)
            })
            .await
    }

    async fn quote(&self, symbol: &str) -> Result<QuoteSummary> {
        let result = self.fetch_options(symbol, None).await?;
        let quote = result.quote.unwrap_or_default();
        let mut expirations: Vec<NaiveDate> = result
            .expiration_dates
            .iter()
            .filter_map(|ts| DateTime::from_timestamp(*ts, 0).map(|dt| dt.date_naive()))
            .collect();
        expirations.sort();

        info!("{}: {} listed expirations", symbol, expirations.len());
        Ok(QuoteSummary {
            symbol: result.underlying_symbol.unwrap_or_else(|| symbol.to_string()),
            price: quote.regular_market_price.unwrap_or(0.0),
            market_cap: quote.market_cap.filter(|c| *c > 0.0).map(|c| c as u64),
            volume: quote.regular_market_volume.map(|v| v as u64),
            expirations,
        })
    }

    async fn option_chain(&self, symbol: &str, expiration: NaiveDate) -> Result<OptionChain> {
        let result = self.fetch_options(symbol, Some(expiration)).await?;
        let chain = result
            .options
            .into_iter()
            .next()
            .unwrap_or_default();

        Ok(OptionChain {
            expiration,
            calls: chain.calls.into_iter().filter_map(YahooContract::into_quote).collect(),
            puts: chain.puts.into_iter().filter_map(YahooContract::into_quote).collect(),
        })
    }
}

fn expiry_timestamp(date: NaiveDate) -> Option<i64> {
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp())
}

#[derive(Debug, Deserialize)]
struct YahooError {
    code: Option<String>,
    description: Option<String>,
}

impl YahooError {
    fn describe(&self) -> String {
        format!(
            "{}: {}",
            self.code.as_deref().unwrap_or("error"),
            self.description.as_deref().unwrap_or("no description")
        )
    }
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: ChartBody,
}

#[derive(Debug, Deserialize)]
struct ChartBody {
    result: Option<Vec<ChartResult>>,
    error: Option<YahooError>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<QuoteSeries>,
}

#[derive(Debug, Deserialize)]
struct QuoteSeries {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

/// Daily bars from a v8 chart response; bars with any missing field are skipped.
fn parse_chart(symbol: &str, body: &str) -> Result<Vec<PriceBar>> {
    let envelope: ChartEnvelope = serde_json::from_str(body)?;
    if let Some(err) = envelope.chart.error {
        info!("No chart data for {}: {}", symbol, err.describe());
        return Err(DataError::EmptyHistory(symbol.to_string()));
    }

    let result = envelope
        .chart
        .result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| DataError::EmptyHistory(symbol.to_string()))?;
    let series = match result.indicators.quote.into_iter().next() {
        Some(series) => series,
        None => return Err(DataError::EmptyHistory(symbol.to_string())),
    };

    let field = |values: &Vec<Option<f64>>, i: usize| values.get(i).copied().flatten();
    let bars: Vec<PriceBar> = result
        .timestamp
        .iter()
        .enumerate()
        .filter_map(|(i, ts)| {
            Some(PriceBar {
                date: DateTime::from_timestamp(*ts, 0)?.with_timezone(&Eastern).date_naive(),
                open: field(&series.open, i)?,
                high: field(&series.high, i)?,
                low: field(&series.low, i)?,
                close: field(&series.close, i)?,
                volume: field(&series.volume, i)? as u64,
            })
        })
        .collect();

    if bars.is_empty() {
        return Err(DataError::EmptyHistory(symbol.to_string()));
    }
    Ok(bars)
}

#[derive(Debug, Deserialize)]
struct OptionsEnvelope {
    #[serde(rename = "optionChain")]
    option_chain: OptionsBody,
}

#[derive(Debug, Deserialize)]
struct OptionsBody {
    result: Option<Vec<OptionsResult>>,
    error: Option<YahooError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OptionsResult {
    underlying_symbol: Option<String>,
    #[serde(default)]
    expiration_dates: Vec<i64>,
    quote: Option<YahooQuote>,
    #[serde(default)]
    options: Vec<YahooChain>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YahooQuote {
    regular_market_price: Option<f64>,
    market_cap: Option<f64>,
    regular_market_volume: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct YahooChain {
    #[serde(default)]
    calls: Vec<YahooContract>,
    #[serde(default)]
    puts: Vec<YahooContract>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YahooContract {
    strike: f64,
    bid: Option<f64>,
    ask: Option<f64>,
    implied_volatility: Option<f64>,
}

impl YahooContract {
    fn into_quote(self) -> Option<OptionQuote> {
        let iv = self.implied_volatility.filter(|v| v.is_finite())?;
        Some(OptionQuote {
            strike: self.strike,
            bid: self.bid.unwrap_or(0.0),
            ask: self.ask.unwrap_or(0.0),
            implied_volatility: iv,
        })
    }
}

fn parse_options(symbol: &str, body: &str) -> Result<OptionsResult> {
    let envelope: OptionsEnvelope = serde_json::from_str(body)?;
    if let Some(err) = envelope.option_chain.error {
        info!("No options data for {}: {}", symbol, err.describe());
        return Err(DataError::NoOptions(symbol.to_string()));
    }
    envelope
        .option_chain
        .result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| DataError::NoOptions(symbol.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::proxy::ProxyPool;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn gateway(server: &MockServer) -> YahooGateway {
        let pool = Arc::new(ProxyPool::with_sources(false, Vec::new()));
        let session = Arc::new(NetworkSession::new(pool, std::time::Duration::from_secs(5), 3));
        YahooGateway::new(session, server.uri())
    }

    fn chart_body() -> serde_json::Value {
        // 2024-01-02, 2024-01-03, 2024-01-04 at 14:30 UTC (09:30 Eastern)
        json!({
            "chart": {
                "result": [{
                    "timestamp": [1704205800, 1704292200, 1704378600],
                    "indicators": {"quote": [{
                        "open":   [100.0, 101.0, null],
                        "high":   [102.0, 103.0, 104.0],
                        "low":    [99.0, 100.5, 101.0],
                        "close":  [101.5, 102.5, 103.0],
                        "volume": [1200000, 1300000, 1400000]
                    }]}
                }],
                "error": null
            }
        })
    }

    #[test]
    fn expirations_stop_at_first_horizon_date() {
        let today = date(2024, 3, 1);
        let listed = vec![
            date(2024, 5, 17),
            date(2024, 3, 8),
            date(2024, 4, 19),
            date(2024, 3, 15),
        ];
        let usable = usable_expirations(&listed, today).unwrap();
        assert_eq!(usable, vec![date(2024, 3, 8), date(2024, 3, 15), date(2024, 4, 19)]);
    }

    #[test]
    fn same_day_expiry_is_dropped() {
        let today = date(2024, 3, 1);
        let listed = vec![today, date(2024, 3, 8), date(2024, 4, 15)];
        let usable = usable_expirations(&listed, today).unwrap();
        assert_eq!(usable, vec![date(2024, 3, 8), date(2024, 4, 15)]);
    }

    #[test]
    fn no_horizon_expiry_is_an_error() {
        let today = date(2024, 3, 1);
        let listed = vec![date(2024, 3, 8), date(2024, 4, 14)];
        assert!(matches!(
            usable_expirations(&listed, today),
            Err(DataError::NoValidExpiration)
        ));
    }

    #[test]
    fn chart_parsing_skips_incomplete_bars() {
        let bars = parse_chart("AAA", &chart_body().to_string()).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, date(2024, 1, 2));
        assert_eq!(bars[1].close, 102.5);
        assert_eq!(bars[1].volume, 1_300_000);
    }

    #[test]
    fn chart_error_means_no_history() {
        let body = json!({"chart": {"result": null, "error": {"code": "Not Found", "description": "No data found"}}});
        assert!(matches!(
            parse_chart("ZZZ", &body.to_string()),
            Err(DataError::EmptyHistory(_))
        ));
    }

    #[tokio::test]
    async fn history_retries_after_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v8/finance/chart/AAA"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v8/finance/chart/AAA"))
            .and(query_param("range", "3mo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chart_body()))
            .mount(&server)
            .await;

        let bars = gateway(&server).history("AAA", HistoryRange::ThreeMonths).await.unwrap();
        assert_eq!(bars.len(), 2);
    }

    #[tokio::test]
    async fn history_gives_up_after_three_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v8/finance/chart/AAA"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let outcome = gateway(&server).history("AAA", HistoryRange::ThreeMonths).await;
        assert!(matches!(outcome, Err(DataError::Status { status: 503, .. })));
    }

    #[tokio::test]
    async fn unknown_symbol_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v8/finance/chart/NOPE"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = gateway(&server).history("NOPE", HistoryRange::OneYear).await;
        assert!(matches!(outcome, Err(DataError::EmptyHistory(_))));
    }

    #[tokio::test]
    async fn quote_and_chain_parse_options_endpoint() {
        let server = MockServer::start().await;
        // 2024-03-08 and 2024-04-19 at 00:00 UTC
        Mock::given(method("GET"))
            .and(path("/v7/finance/options/AAA"))
            .and(query_param("date", "1709856000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "optionChain": {"result": [{
                    "underlyingSymbol": "AAA",
                    "expirationDates": [1709856000, 1713484800],
                    "quote": {"regularMarketPrice": 100.0},
                    "options": [{
                        "expirationDate": 1709856000,
                        "calls": [
                            {"strike": 100.0, "bid": 2.0, "ask": 2.2, "impliedVolatility": 0.6},
                            {"strike": 105.0, "bid": 0.5, "ask": 0.7}
                        ],
                        "puts": [{"strike": 100.0, "bid": 1.9, "ask": 2.1, "impliedVolatility": 0.62}]
                    }]
                }], "error": null}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v7/finance/options/AAA"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "optionChain": {"result": [{
                    "underlyingSymbol": "AAA",
                    "expirationDates": [1713484800, 1709856000],
                    "quote": {"regularMarketPrice": 100.0, "marketCap": 2500000000u64, "regularMarketVolume": 1800000},
                    "options": []
                }], "error": null}
            })))
            .mount(&server)
            .await;

        let gateway = gateway(&server);
        let quote = gateway.quote("AAA").await.unwrap();
        assert_eq!(quote.price, 100.0);
        assert_eq!(quote.market_cap, Some(2_500_000_000));
        assert_eq!(quote.volume, Some(1_800_000));
        assert_eq!(quote.expirations, vec![date(2024, 3, 8), date(2024, 4, 19)]);

        let chain = gateway.option_chain("AAA", date(2024, 3, 8)).await.unwrap();
        assert_eq!(chain.calls.len(), 1);
        assert_eq!(chain.puts.len(), 1);
        assert!((chain.calls[0].mid().unwrap() - 2.1).abs() < 1e-12);
    }
}
