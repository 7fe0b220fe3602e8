// src/main.rs
use anyhow::anyhow;
use dotenv::dotenv;
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use warp::Filter;

use earnings_vol::config::AppConfig;
use earnings_vol::context::AppContext;
use earnings_vol::routes;

/// Periodic cache sweep and, while proxying is on, proxy list refresh.
async fn start_jobs(ctx: Arc<AppContext>) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new()
        .await
        .map_err(|e| anyhow!("creating job scheduler: {:?}", e))?;

    let cache = ctx.cache.clone();
    let sweep = Job::new_async(ctx.config.cache_sweep_cron.as_str(), move |_uuid, _lock| {
        let cache = cache.clone();
        Box::pin(async move {
            let removed = cache.clear_expired().await;
            info!("Cache sweep finished, {} entries removed", removed);
        })
    })
    .map_err(|e| anyhow!("invalid cache sweep schedule: {:?}", e))?;
    scheduler
        .add(sweep)
        .await
        .map_err(|e| anyhow!("scheduling cache sweep: {:?}", e))?;

    let proxies = ctx.proxies.clone();
    let refresh = Job::new_async(ctx.config.proxy_refresh_cron.as_str(), move |_uuid, _lock| {
        let proxies = proxies.clone();
        Box::pin(async move {
            if proxies.is_enabled() {
                let total = proxies.refresh().await;
                info!("Scheduled proxy refresh: {} endpoints", total);
            }
        })
    })
    .map_err(|e| anyhow!("invalid proxy refresh schedule: {:?}", e))?;
    scheduler
        .add(refresh)
        .await
        .map_err(|e| anyhow!("scheduling proxy refresh: {:?}", e))?;

    scheduler
        .start()
        .await
        .map_err(|e| anyhow!("starting job scheduler: {:?}", e))?;
    info!(
        "Jobs scheduled: cache sweep '{}', proxy refresh '{}'",
        ctx.config.cache_sweep_cron, ctx.config.proxy_refresh_cron
    );
    Ok(scheduler)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();
    info!("Logger initialized. Starting the application...");

    let config = AppConfig::from_env();
    info!("Using PORT: {}", config.port);
    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();

    let ctx = Arc::new(AppContext::from_config(config).await?);
    if ctx.proxies.is_enabled() {
        info!("Proxying enabled, fetching initial proxy list");
        if ctx.proxies.refresh().await == 0 {
            error!("No proxies available, requests will go out directly");
        }
    }

    let _scheduler = start_jobs(ctx.clone()).await?;

    let cors = warp::cors()
        .allow_any_origin()
        .allow_header("content-type")
        .allow_methods(vec!["GET", "POST", "PUT"]);

    let api = routes::routes(ctx).with(cors);
    info!("Routes configured successfully with CORS.");

    info!("Starting server on {}", addr);
    warp::serve(api).run(addr).await;
    Ok(())
}
