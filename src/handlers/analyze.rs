// src/handlers/analyze.rs
use std::sync::Arc;
use warp::reply::Json;
use warp::Rejection;
use log::{error, info};

use crate::context::AppContext;
use crate::handlers::error::ApiError;

pub async fn analyze_symbol(symbol: String, ctx: Arc<AppContext>) -> Result<Json, Rejection> {
    match ctx.scanner.analyze_one(&symbol).await {
        Ok(result) => {
            info!("Analyzed {}: {}", result.ticker, result.recommendation);
            Ok(warp::reply::json(&result))
        }
        Err(e) => {
            error!("Failed to analyze '{}': {}", symbol, e);
            Err(warp::reject::custom(ApiError::from(e)))
        }
    }
}
