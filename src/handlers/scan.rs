// src/handlers/scan.rs
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;
use warp::reply::Json;
use warp::{Rejection, Reply};
use log::{debug, error, info};

use crate::context::AppContext;
use crate::handlers::error::ApiError;
use crate::services::export::{to_csv_string, ResultFilter};
use crate::services::scanner::{ProgressFn, ScanReport};

fn filter_from(params: &HashMap<String, String>) -> Result<ResultFilter, Rejection> {
    ResultFilter::from_params(
        params.get("earnings_time").map(String::as_str),
        params.get("recommendation").map(String::as_str),
    )
    .map_err(|e| warp::reject::custom(ApiError::bad_request(e)))
}

async fn run_scan(date: NaiveDate, ctx: &AppContext) -> ScanReport {
    let progress: ProgressFn = &|p: f64| debug!("Scan {} at {:.0}%", date, p);
    let report = ctx.scanner.scan(date, Some(progress)).await;
    info!("{}", report.status);
    report
}

pub async fn scan_date(
    date: NaiveDate,
    params: HashMap<String, String>,
    ctx: Arc<AppContext>,
) -> Result<Json, Rejection> {
    let filter = filter_from(&params)?;
    let mut report = run_scan(date, &ctx).await;
    report.results = filter.apply(&report.results);
    Ok(warp::reply::json(&report))
}

pub async fn scan_csv(
    date: NaiveDate,
    params: HashMap<String, String>,
    ctx: Arc<AppContext>,
) -> Result<impl Reply, Rejection> {
    let filter = filter_from(&params)?;
    let report = run_scan(date, &ctx).await;
    let body = to_csv_string(&filter.apply(&report.results)).map_err(|e| {
        error!("CSV export for {} failed: {}", date, e);
        warp::reject::custom(ApiError::new(format!("CSV export failed: {}", e)))
    })?;

    let disposition = format!("attachment; filename=\"earnings_{}.csv\"", date);
    Ok(warp::reply::with_header(
        warp::reply::with_header(body, "content-type", "text/csv"),
        "content-disposition",
        disposition,
    ))
}
