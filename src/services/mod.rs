// src/services/mod.rs
pub mod analyzer;
pub mod cache;
pub mod earnings_calendar;
pub mod error;
pub mod export;
pub mod market_data;
pub mod proxy;
pub mod scanner;
pub mod session;
pub mod volatility;
