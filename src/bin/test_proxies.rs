// src/bin/test_proxies.rs
use dotenv::dotenv;
use earnings_vol::services::proxy::{ProxyPool, ProxyProvider, ProxySource};
use log::{error, info};
use reqwest::Client;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    info!("Testing proxy providers...");
    let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
    for provider in ProxyProvider::ALL {
        match provider.fetch(&client).await {
            Ok(found) => info!("SUCCESS: {} returned {} proxies", provider.name(), found.len()),
            Err(e) => error!("ERROR: {} failed: {}", provider.name(), e),
        }
    }

    let pool = ProxyPool::new(true);
    let total = pool.refresh().await;
    info!("Merged pool: {} unique proxies", total);
    if let Some(proxy) = pool.acquire() {
        info!("Sample proxy: {}", proxy);
    }
    Ok(())
}
