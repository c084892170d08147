//! Market data client trait and structured error types.
//!
//! The MarketDataClient trait abstracts over data sources (Yahoo Finance today)
//! so the reconciliation engine can be driven by a scripted client in tests.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One daily bar as persisted in a series file.
///
/// Field order is column order; the serde names are the CSV header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    #[serde(rename = "Date")]
    pub date: NaiveDate,
    #[serde(rename = "Open")]
    pub open: f64,
    #[serde(rename = "High")]
    pub high: f64,
    #[serde(rename = "Low")]
    pub low: f64,
    #[serde(rename = "Close")]
    pub close: f64,
    #[serde(rename = "Adj Close")]
    pub adj_close: f64,
    #[serde(rename = "Volume")]
    pub volume: u64,
    #[serde(rename = "Dividends")]
    pub dividends: f64,
    #[serde(rename = "Stock Splits")]
    pub stock_splits: f64,
}

impl PriceBar {
    /// Bar with no corporate actions and adj close equal to close.
    pub fn ohlcv(date: NaiveDate, open: f64, high: f64, low: f64, close: f64, volume: u64) -> Self {
        Self {
            date,
            open,
            high,
            low,
            close,
            adj_close: close,
            volume,
            dividends: 0.0,
            stock_splits: 0.0,
        }
    }
}

/// One contract row of an options chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionQuote {
    pub contract_symbol: String,
    pub last_trade_date: Option<DateTime<Utc>>,
    pub strike: f64,
    pub last_price: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub change: Option<f64>,
    pub percent_change: Option<f64>,
    pub volume: Option<u64>,
    pub open_interest: Option<u64>,
    pub implied_volatility: Option<f64>,
    pub in_the_money: bool,
    pub contract_size: Option<String>,
    pub currency: Option<String>,
}

/// Calls and puts for a single expiration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionChain {
    pub calls: Vec<OptionQuote>,
    pub puts: Vec<OptionQuote>,
}

/// Structured error types for market data operations.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("hard stop: data provider has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("HTTP {status} for {symbol}")]
    Http { status: u16, symbol: String },

    #[error("http cache error: {0}")]
    Cache(String),
}

impl DataError {
    /// Errors worth another attempt after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DataError::NetworkUnreachable(_)
                | DataError::RateLimited { .. }
                | DataError::Http { .. }
        )
    }
}

/// Trait for market data clients.
///
/// Implementations are shared across worker threads, so they must be
/// `Send + Sync`. The store sits above this trait; clients don't know about it.
pub trait MarketDataClient: Send + Sync {
    /// Human-readable name of this client.
    fn name(&self) -> &str;

    /// Entire available daily history for a symbol, ascending by date.
    fn get_full_history(&self, symbol: &str) -> Result<Vec<PriceBar>, DataError>;

    /// Daily bars in the half-open range `[begin, end)`.
    fn get_history(
        &self,
        symbol: &str,
        begin: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>, DataError>;

    /// Listed option expirations for an underlying. Empty if it has no options.
    fn list_option_expirations(&self, symbol: &str) -> Result<Vec<NaiveDate>, DataError>;

    /// Calls and puts for one expiration.
    fn get_option_chain(&self, symbol: &str, expiration: NaiveDate)
        -> Result<OptionChain, DataError>;

    /// False once the client refuses further requests (e.g. circuit breaker open).
    fn is_available(&self) -> bool;
}
