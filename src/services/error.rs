// src/services/error.rs
use thiserror::Error;

/// Failures from the market data and calendar gateways.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("no symbol provided")]
    EmptySymbol,

    #[error("no options for {0}")]
    NoOptions(String),

    #[error("no expiration 45+ days out")]
    NoValidExpiration,

    #[error("no ATM implied volatility found")]
    NoAtmIv,

    #[error("no price history for {0}")]
    EmptyHistory(String),

    #[error("not enough price history to estimate volatility for {0}")]
    InsufficientHistory(String),
}

impl DataError {
    /// Transient failures are worth another attempt through a different proxy.
    /// Data-absence failures are final.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DataError::Network(_) | DataError::Status { .. } | DataError::Parse(_)
        )
    }
}

impl From<reqwest::Error> for DataError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            DataError::Parse(e.to_string())
        } else {
            DataError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for DataError {
    fn from(e: serde_json::Error) -> Self {
        DataError::Parse(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache entry is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("no cache entry for key {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, DataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(DataError::Network("reset".into()).is_transient());
        assert!(DataError::Status { status: 503, url: "x".into() }.is_transient());
        assert!(DataError::Parse("eof".into()).is_transient());
        assert!(!DataError::NoOptions("AAA".into()).is_transient());
        assert!(!DataError::NoValidExpiration.is_transient());
        assert!(!DataError::EmptyHistory("AAA".into()).is_transient());
    }
}
