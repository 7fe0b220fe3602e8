// src/handlers/proxy.rs
use std::sync::Arc;
use warp::reply::Json;
use warp::Rejection;
use log::info;

use crate::context::AppContext;

fn status_body(ctx: &AppContext) -> serde_json::Value {
    serde_json::json!({
        "enabled": ctx.proxies.is_enabled(),
        "count": ctx.proxies.len(),
        "current": ctx.proxies.current(),
    })
}

pub async fn proxy_status(ctx: Arc<AppContext>) -> Result<Json, Rejection> {
    Ok(warp::reply::json(&status_body(&ctx)))
}

pub async fn refresh_proxies(ctx: Arc<AppContext>) -> Result<Json, Rejection> {
    let total = ctx.proxies.refresh().await;
    info!("Proxy list refreshed on request: {} endpoints", total);
    Ok(warp::reply::json(&status_body(&ctx)))
}

/// Toggle proxying. Enabling with an empty pool fetches a list first.
pub async fn set_proxies_enabled(enabled: bool, ctx: Arc<AppContext>) -> Result<Json, Rejection> {
    ctx.proxies.set_enabled(enabled);
    if enabled && ctx.proxies.is_empty() {
        ctx.proxies.refresh().await;
    }
    Ok(warp::reply::json(&status_body(&ctx)))
}
