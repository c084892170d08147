//! Per-series reconciliation: full backfill or incremental update.
//!
//! The only input is the store's watermark. No watermark means the series has
//! never been fetched and the whole history is requested; otherwise only the
//! days after the watermark up to (not including) today are requested. Either
//! way the still-forming bar for today is never persisted.

use super::layout::SeriesKey;
use super::provider::{DataError, MarketDataClient, PriceBar};
use super::store::{SeriesStore, StoreError};
use chrono::{Days, NaiveDate};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// How a series was brought up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    FullBackfill,
    Incremental { begin: NaiveDate, end: NaiveDate },
}

impl fmt::Display for FetchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchMode::FullBackfill => write!(f, "full backfill"),
            FetchMode::Incremental { begin, end } => write!(f, "incremental [{begin}, {end})"),
        }
    }
}

/// Successful result of reconciling one series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolOutcome {
    Created { path: PathBuf, rows: usize },
    Appended { count: usize },
    UpToDate,
}

#[derive(Debug, Error)]
pub enum SymbolError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] DataError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("contract {contract} listed more than once for {underlying}")]
    DuplicateContract {
        underlying: String,
        contract: String,
    },

    #[error("contract symbol {contract:?} for {underlying} is not a valid file name")]
    InvalidContract {
        underlying: String,
        contract: String,
    },
}

impl SymbolError {
    /// Provider had nothing for a full backfill: likely delisted or invalid.
    pub fn is_no_data(&self) -> bool {
        matches!(self, SymbolError::Store(StoreError::NoData { .. }))
    }
}

/// Pick the fetch mode from the current watermark.
///
/// Returns `None` when the series is already caught up for `today`.
pub fn plan(watermark: Option<NaiveDate>, today: NaiveDate) -> Option<FetchMode> {
    let Some(watermark) = watermark else {
        return Some(FetchMode::FullBackfill);
    };
    let begin = watermark.checked_add_days(Days::new(1))?;
    (begin < today).then_some(FetchMode::Incremental { begin, end: today })
}

/// Sort by date and keep the first row for each date.
pub fn normalize(mut bars: Vec<PriceBar>) -> Vec<PriceBar> {
    bars.sort_by_key(|b| b.date);
    bars.dedup_by_key(|b| b.date);
    bars
}

pub struct Reconciler<'a> {
    client: &'a dyn MarketDataClient,
    store: &'a SeriesStore,
}

impl<'a> Reconciler<'a> {
    pub fn new(client: &'a dyn MarketDataClient, store: &'a SeriesStore) -> Self {
        Self { client, store }
    }

    /// Bring one series up to date as of `today` (UTC).
    pub fn reconcile(&self, key: &SeriesKey, today: NaiveDate) -> Result<SymbolOutcome, SymbolError> {
        let watermark = self.store.read_watermark(key)?;
        let Some(mode) = plan(watermark, today) else {
            tracing::debug!(series = %key, ?watermark, "already caught up, skipping fetch");
            return Ok(SymbolOutcome::UpToDate);
        };

        self.execute(key, mode, watermark, today).map_err(|e| {
            if matches!(e, SymbolError::Store(StoreError::AlreadyExists { .. })) {
                tracing::error!(series = %key, %mode, error = %e, "backfill target already exists; watermark read disagrees with store");
            } else {
                tracing::warn!(series = %key, %mode, error = %e, "series update failed");
            }
            e
        })
    }

    fn execute(
        &self,
        key: &SeriesKey,
        mode: FetchMode,
        watermark: Option<NaiveDate>,
        today: NaiveDate,
    ) -> Result<SymbolOutcome, SymbolError> {
        let symbol = key.symbol();

        match mode {
            FetchMode::FullBackfill => {
                tracing::info!(series = %key, "fetching all history");
                // `range=max` includes the live bar for today; it is fetched tomorrow.
                let bars: Vec<PriceBar> = normalize(self.client.get_full_history(symbol)?)
                    .into_iter()
                    .filter(|b| b.date < today)
                    .collect();
                let rows = bars.len();
                let path = self.store.create_with_full_history(key, &bars)?;
                tracing::info!(series = %key, rows, path = %path.display(), "created series");
                Ok(SymbolOutcome::Created { path, rows })
            }
            FetchMode::Incremental { begin, end } => {
                tracing::info!(series = %key, %begin, %end, "fetching updates");
                let fetched = self.client.get_history(symbol, begin, end)?;
                // Providers occasionally resend the watermark bar.
                let bars: Vec<PriceBar> = normalize(fetched)
                    .into_iter()
                    .filter(|b| watermark.map_or(true, |w| b.date > w))
                    .collect();

                let count = self.store.append(key, &bars)?;
                if count == 0 {
                    tracing::debug!(series = %key, "no new rows");
                    Ok(SymbolOutcome::UpToDate)
                } else {
                    tracing::info!(series = %key, count, "appended rows");
                    Ok(SymbolOutcome::Appended { count })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, day).unwrap()
    }

    fn bar(date: NaiveDate, close: f64) -> PriceBar {
        PriceBar::ohlcv(date, close, close, close, close, 1)
    }

    #[test]
    fn no_watermark_means_backfill() {
        assert_eq!(plan(None, d(3, 1)), Some(FetchMode::FullBackfill));
    }

    #[test]
    fn incremental_starts_the_day_after_watermark() {
        assert_eq!(
            plan(Some(d(2, 26)), d(3, 1)),
            Some(FetchMode::Incremental {
                begin: d(2, 27),
                end: d(3, 1)
            })
        );
    }

    #[test]
    fn caught_up_when_watermark_is_yesterday_or_later() {
        assert_eq!(plan(Some(d(2, 29)), d(3, 1)), None);
        assert_eq!(plan(Some(d(3, 1)), d(3, 1)), None);
        assert_eq!(plan(Some(d(3, 5)), d(3, 1)), None);
    }

    #[test]
    fn normalize_sorts_and_keeps_first_duplicate() {
        let bars = normalize(vec![
            bar(d(1, 3), 3.0),
            bar(d(1, 2), 2.0),
            bar(d(1, 3), 99.0),
        ]);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, d(1, 2));
        assert_eq!(bars[1].close, 3.0);
    }

    #[test]
    fn no_data_classification() {
        let err = SymbolError::from(StoreError::NoData {
            symbol: "ZZZZ".into(),
        });
        assert!(err.is_no_data());
        let err = SymbolError::from(DataError::CircuitBreakerTripped);
        assert!(!err.is_no_data());
    }
}
