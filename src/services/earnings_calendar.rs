// src/services/earnings_calendar.rs
use async_trait::async_trait;
use chrono::NaiveDate;
use log::{info, warn};
use scraper::{Html, Selector};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use crate::models::{EarningsAnnouncement, EarningsTiming};
use super::error::{DataError, Result};
use super::session::{checked_text, NetworkSession};

const CALENDAR_REFERER: &str = "https://www.investing.com/earnings-calendar/";
/// investing.com's identifier for United States listings.
const US_COUNTRY_CODE: &str = "5";

/// Symbols reporting on a given date.
#[async_trait]
pub trait EarningsCalendar: Send + Sync {
    async fn earnings_on(&self, date: NaiveDate) -> Result<Vec<EarningsAnnouncement>>;
}

pub struct InvestingCalendar {
    session: Arc<NetworkSession>,
    url: String,
}

impl InvestingCalendar {
    pub fn new(session: Arc<NetworkSession>, url: impl Into<String>) -> Self {
        InvestingCalendar { session, url: url.into() }
    }
}

#[async_trait]
impl EarningsCalendar for InvestingCalendar {
    async fn earnings_on(&self, date: NaiveDate) -> Result<Vec<EarningsAnnouncement>> {
        let day = date.format("%Y-%m-%d").to_string();
        let day = day.as_str();
        let url = self.url.as_str();
        info!("Fetching earnings for {}", day);

        let announcements = self
            .session
            .with_retry(&format!("earnings calendar {}", day), move |client| async move {
                let resp = client
                    .post(url)
                    .header("X-Requested-With", "XMLHttpRequest")
                    .header("Accept", "application/json, text/javascript, */*; q=0.01")
                    .header("Referer", CALENDAR_REFERER)
                    .form(&[
                        ("country[]", US_COUNTRY_CODE),
                        ("dateFrom", day),
                        ("dateTo", day),
                        ("currentTab", "custom"),
                        ("limit_from", "0"),
                    ])
                    .send()
                    .await?;
                let body = checked_text(resp).await?;
                parse_calendar_response(&body)
            })
            .await?;

        info!("Found {} tickers for {}", announcements.len(), day);
        Ok(announcements)
    }
}

/// The endpoint wraps an HTML table fragment in a JSON object under `data`.
pub fn parse_calendar_response(body: &str) -> Result<Vec<EarningsAnnouncement>> {
    let json: Value = serde_json::from_str(body)?;
    let fragment = json
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| DataError::Parse("calendar response has no data fragment".to_string()))?;
    parse_calendar_rows(fragment)
}

/// Extract `(symbol, timing)` pairs from calendar table rows. Rows without a
/// company cell are skipped; a symbol listed twice keeps its first timing.
pub fn parse_calendar_rows(fragment: &str) -> Result<Vec<EarningsAnnouncement>> {
    let document = Html::parse_document(&format!("<table>{}</table>", fragment));
    let row_selector = Selector::parse("tr").map_err(|e| DataError::Parse(format!("{:?}", e)))?;
    let company_selector = Selector::parse("span.earnCalCompanyName")
        .map_err(|e| DataError::Parse(format!("{:?}", e)))?;
    let ticker_selector =
        Selector::parse("a.bold").map_err(|e| DataError::Parse(format!("{:?}", e)))?;
    let timing_selector = Selector::parse("span.genToolTip")
        .map_err(|e| DataError::Parse(format!("{:?}", e)))?;

    let mut seen = HashSet::new();
    let mut announcements = Vec::new();
    for row in document.select(&row_selector) {
        if row.select(&company_selector).next().is_none() {
            continue;
        }
        let symbol = match row.select(&ticker_selector).next() {
            Some(link) => link.text().collect::<String>().trim().to_string(),
            None => {
                warn!("Calendar row without a ticker link, skipping");
                continue;
            }
        };
        if symbol.is_empty() || !seen.insert(symbol.clone()) {
            continue;
        }

        let timing = row
            .select(&timing_selector)
            .find_map(|span| span.value().attr("data-tooltip"))
            .map(timing_from_tooltip)
            .unwrap_or(EarningsTiming::DuringMarket);

        announcements.push(EarningsAnnouncement { symbol, timing });
    }
    Ok(announcements)
}

fn timing_from_tooltip(tooltip: &str) -> EarningsTiming {
    match tooltip.trim() {
        "Before market open" => EarningsTiming::PreMarket,
        "After market close" => EarningsTiming::PostMarket,
        _ => EarningsTiming::DuringMarket,
    }
}
