// src/bin/scan_earnings.rs
use anyhow::Context;
use chrono::NaiveDate;
use dotenv::dotenv;
use earnings_vol::config::AppConfig;
use earnings_vol::context::AppContext;
use earnings_vol::services::export::{row_values, write_csv, HEADINGS};
use earnings_vol::services::market_data::market_today;
use earnings_vol::services::scanner::ProgressFn;
use log::info;
use std::env;
use std::fs::File;

/// Usage: scan_earnings [YYYY-MM-DD] [output.csv]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let mut args = env::args().skip(1);
    let date = match args.next() {
        Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .with_context(|| format!("'{}' is not a YYYY-MM-DD date", raw))?,
        None => market_today(),
    };
    let csv_path = args.next();

    let ctx = AppContext::from_config(AppConfig::from_env()).await?;
    if ctx.proxies.is_enabled() {
        ctx.proxies.refresh().await;
    }

    info!("Scanning earnings for {}...", date);
    let progress: ProgressFn = &|p: f64| info!("Progress: {:.0}%", p);
    let report = ctx.scanner.scan(date, Some(progress)).await;
    info!("{}", report.status);

    println!("{}", HEADINGS.join(" | "));
    for result in &report.results {
        println!("{}", row_values(result).join(" | "));
    }

    if let Some(path) = csv_path {
        let file = File::create(&path).with_context(|| format!("creating {}", path))?;
        write_csv(file, &report.results)?;
        info!("Exported {} rows to {}", report.results.len(), path);
    }

    Ok(())
}
