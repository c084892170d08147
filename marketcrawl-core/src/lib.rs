//! marketcrawl core: daily OHLCV and options crawler.
//!
//! This crate contains:
//! - The append-only xz-compressed CSV series store
//! - Watermark-driven reconciliation (full backfill vs incremental update)
//! - The Yahoo Finance client with retry, circuit breaker and response cache
//! - Option chain snapshots and in-the-money contract selection
//! - The crawl orchestrator with a bounded worker pool for option contracts

pub mod config;
pub mod data;
pub mod logging;

pub use config::{ConfigError, CrawlConfig};
