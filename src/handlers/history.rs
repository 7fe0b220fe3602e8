// src/handlers/history.rs
use std::sync::Arc;
use warp::reply::Json;
use warp::Rejection;
use log::{error, info};

use crate::context::AppContext;
use crate::handlers::error::ApiError;
use crate::services::analyzer::normalize_symbol;
use crate::services::market_data::HistoryRange;

/// One year of daily bars for charting.
pub async fn price_history(symbol: String, ctx: Arc<AppContext>) -> Result<Json, Rejection> {
    let symbol = normalize_symbol(&symbol)
        .ok_or_else(|| warp::reject::custom(ApiError::bad_request("no symbol provided")))?;

    match ctx.market.history(&symbol, HistoryRange::OneYear).await {
        Ok(bars) => {
            info!("Fetched {} bars of history for {}", bars.len(), symbol);
            Ok(warp::reply::json(&serde_json::json!({
                "symbol": symbol,
                "bars": bars,
            })))
        }
        Err(e) => {
            error!("Failed to fetch history for {}: {}", symbol, e);
            Err(warp::reject::custom(ApiError::from(e)))
        }
    }
}
