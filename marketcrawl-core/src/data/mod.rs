//! Market data fetching and the append-only series store

pub mod circuit_breaker;
pub mod crawl;
pub mod http_cache;
pub mod layout;
pub mod options;
pub mod provider;
pub mod reconcile;
pub mod store;
pub mod yahoo;

pub use circuit_breaker::CircuitBreaker;
pub use crawl::{
    CrawlOptions, CrawlProgress, CrawlSummary, Crawler, LogProgress, OptionsFailure, SeriesReport,
};
pub use http_cache::HttpCache;
pub use layout::{DataLayout, OptionSide, SeriesKey};
pub use options::{scan_chains, select_in_the_money, ChainScan, OptionsError};
pub use provider::{DataError, MarketDataClient, OptionChain, OptionQuote, PriceBar};
pub use reconcile::{FetchMode, Reconciler, SymbolError, SymbolOutcome};
pub use store::{SeriesStore, StoreError, VerifyReport};
pub use yahoo::{YahooConfig, YahooProvider};
