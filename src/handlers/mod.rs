// src/handlers/mod.rs
pub mod analyze;
pub mod error;
pub mod history;
pub mod proxy;
pub mod scan;
