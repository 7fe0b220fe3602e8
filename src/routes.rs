// src/routes.rs
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;
use warp::reject::Rejection;
use crate::context::AppContext;
use crate::handlers::{
    analyze::analyze_symbol, history::price_history, proxy::proxy_status,
    proxy::refresh_proxies, proxy::set_proxies_enabled, scan::scan_csv, scan::scan_date,
};
use log::info;

use std::convert::Infallible;
use warp::{Filter, Reply};
use crate::handlers::error::ApiError;

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let code;
    let message;

    if err.is_not_found() {
        code = warp::http::StatusCode::NOT_FOUND;
        message = "Not Found";
    } else if let Some(api_error) = err.find::<ApiError>() {
        code = api_error.status;
        message = &api_error.message;
    } else if err.find::<warp::reject::InvalidQuery>().is_some() {
        code = warp::http::StatusCode::BAD_REQUEST;
        message = "Invalid query string";
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        code = warp::http::StatusCode::METHOD_NOT_ALLOWED;
        message = "Method Not Allowed";
    } else {
        code = warp::http::StatusCode::INTERNAL_SERVER_ERROR;
        message = "Internal Server Error";
    }

    Ok(warp::reply::with_status(
        warp::reply::json(&serde_json::json!({
            "error": message,
        })),
        code,
    ))
}

pub fn routes(ctx: Arc<AppContext>) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    info!("Configuring routes...");

    let ctx_filter = warp::any().map(move || ctx.clone());

    let analyze_route = warp::path!("api" / "v1" / "analyze" / String)
        .and(warp::get())
        .and(ctx_filter.clone())
        .and_then(analyze_symbol);

    let scan_route = warp::path!("api" / "v1" / "scan" / NaiveDate)
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(ctx_filter.clone())
        .and_then(scan_date);

    let scan_csv_route = warp::path!("api" / "v1" / "scan" / NaiveDate / "csv")
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .and(ctx_filter.clone())
        .and_then(scan_csv);

    let history_route = warp::path!("api" / "v1" / "history" / String)
        .and(warp::get())
        .and(ctx_filter.clone())
        .and_then(price_history);

    let proxy_status_route = warp::path!("api" / "v1" / "proxies")
        .and(warp::get())
        .and(ctx_filter.clone())
        .and_then(proxy_status);

    let proxy_refresh_route = warp::path!("api" / "v1" / "proxies" / "refresh")
        .and(warp::post())
        .and(ctx_filter.clone())
        .and_then(refresh_proxies);

    let proxy_toggle_route = warp::path!("api" / "v1" / "proxies" / "enabled" / bool)
        .and(warp::put())
        .and(ctx_filter.clone())
        .and_then(set_proxies_enabled);

    info!("All routes configured successfully.");

    analyze_route
        .or(scan_route)
        .or(scan_csv_route)
        .or(history_route)
        .or(proxy_status_route)
        .or(proxy_refresh_route)
        .or(proxy_toggle_route)
        .recover(handle_rejection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use tempfile::TempDir;

    async fn context() -> (TempDir, Arc<AppContext>) {
        let dir = TempDir::new().unwrap();
        let config = AppConfig {
            cache_dir: dir.path().join("stock_cache"),
            ..AppConfig::default()
        };
        let ctx = AppContext::from_config(config).await.unwrap();
        (dir, Arc::new(ctx))
    }

    #[tokio::test]
    async fn proxy_status_reports_disabled_pool() {
        let (_dir, ctx) = context().await;
        let resp = warp::test::request()
            .method("GET")
            .path("/api/v1/proxies")
            .reply(&routes(ctx))
            .await;

        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["enabled"], false);
        assert_eq!(body["count"], 0);
        assert!(body["current"].is_null());
    }

    #[tokio::test]
    async fn disabling_proxies_does_not_fetch() {
        let (_dir, ctx) = context().await;
        let resp = warp::test::request()
            .method("PUT")
            .path("/api/v1/proxies/enabled/false")
            .reply(&routes(ctx.clone()))
            .await;

        assert_eq!(resp.status(), 200);
        assert!(!ctx.proxies.is_enabled());
    }

    #[tokio::test]
    async fn unknown_filter_value_is_rejected() {
        let (_dir, ctx) = context().await;
        let resp = warp::test::request()
            .method("GET")
            .path("/api/v1/scan/2024-03-01?recommendation=Maybe")
            .reply(&routes(ctx))
            .await;

        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["error"], "unknown recommendation 'Maybe'");
    }

    #[tokio::test]
    async fn malformed_date_is_not_found() {
        let (_dir, ctx) = context().await;
        let resp = warp::test::request()
            .method("GET")
            .path("/api/v1/scan/yesterday")
            .reply(&routes(ctx))
            .await;

        assert_eq!(resp.status(), 404);
    }
}
