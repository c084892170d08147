//! Crawl orchestrator. Drives reconciliation over the configured symbols.
//!
//! Equities are processed one at a time in configured order. After each
//! equity, its option chains are snapshotted and the in-the-money contracts
//! are reconciled on a bounded rayon pool. A failing series is recorded in the
//! summary and never stops its siblings.

use super::layout::{is_safe_name, SeriesKey};
use super::options::{scan_chains, OptionsError};
use super::provider::{DataError, MarketDataClient};
use super::reconcile::{Reconciler, SymbolError, SymbolOutcome};
use super::store::SeriesStore;
use chrono::NaiveDate;
use rayon::prelude::*;

/// Knobs for a single crawl.
#[derive(Debug, Clone)]
pub struct CrawlOptions {
    /// Current UTC calendar date; incremental fetches stop before it.
    pub today: NaiveDate,
    /// Snapshot chains and track in-the-money contracts after each equity.
    pub include_options: bool,
    /// Worker threads for option contract reconciliation.
    pub workers: usize,
}

/// Outcome of one series.
#[derive(Debug)]
pub struct SeriesReport {
    pub key: SeriesKey,
    pub result: Result<SymbolOutcome, SymbolError>,
}

/// Options listing or snapshot failure; `expiration` is `None` when the listing itself failed.
#[derive(Debug)]
pub struct OptionsFailure {
    pub underlying: String,
    pub expiration: Option<NaiveDate>,
    pub error: OptionsError,
}

#[derive(Debug, Default)]
pub struct CrawlSummary {
    pub reports: Vec<SeriesReport>,
    pub options_failures: Vec<OptionsFailure>,
}

impl CrawlSummary {
    pub fn created(&self) -> usize {
        self.count(|r| matches!(r, Ok(SymbolOutcome::Created { .. })))
    }

    pub fn appended(&self) -> usize {
        self.count(|r| matches!(r, Ok(SymbolOutcome::Appended { .. })))
    }

    pub fn up_to_date(&self) -> usize {
        self.count(|r| matches!(r, Ok(SymbolOutcome::UpToDate)))
    }

    pub fn no_data(&self) -> usize {
        self.count(|r| r.as_ref().is_err_and(SymbolError::is_no_data))
    }

    pub fn failed(&self) -> usize {
        self.count(|r| r.is_err())
    }

    /// Rows written across created and appended series.
    pub fn rows_written(&self) -> usize {
        self.reports
            .iter()
            .map(|r| match &r.result {
                Ok(SymbolOutcome::Created { rows, .. }) => *rows,
                Ok(SymbolOutcome::Appended { count }) => *count,
                _ => 0,
            })
            .sum()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed() == 0 && self.options_failures.is_empty()
    }

    pub fn report(&self, key: &SeriesKey) -> Option<&SeriesReport> {
        self.reports.iter().find(|r| &r.key == key)
    }

    fn count(&self, pred: impl Fn(&Result<SymbolOutcome, SymbolError>) -> bool) -> usize {
        self.reports.iter().filter(|r| pred(&r.result)).count()
    }
}

/// Progress callbacks for a crawl. Called from worker threads for contracts.
pub trait CrawlProgress: Sync {
    fn on_symbol_start(&self, symbol: &str, index: usize, total: usize);

    fn on_contracts_start(&self, underlying: &str, count: usize);

    fn on_series_complete(&self, key: &SeriesKey, result: &Result<SymbolOutcome, SymbolError>);

    fn on_batch_complete(&self, summary: &CrawlSummary);
}

/// Progress reporter that emits `tracing` events.
pub struct LogProgress;

impl CrawlProgress for LogProgress {
    fn on_symbol_start(&self, symbol: &str, index: usize, total: usize) {
        tracing::info!(symbol, "[{}/{}] updating {symbol}", index + 1, total);
    }

    fn on_contracts_start(&self, underlying: &str, count: usize) {
        tracing::info!(symbol = underlying, count, "updating option contract histories");
    }

    fn on_series_complete(&self, key: &SeriesKey, result: &Result<SymbolOutcome, SymbolError>) {
        match result {
            Ok(SymbolOutcome::Created { rows, .. }) => {
                tracing::info!(series = %key, rows, "created")
            }
            Ok(SymbolOutcome::Appended { count }) => {
                tracing::info!(series = %key, count, "appended")
            }
            Ok(SymbolOutcome::UpToDate) => tracing::debug!(series = %key, "up to date"),
            Err(e) if e.is_no_data() => {
                tracing::warn!(series = %key, "no data (delisted or invalid symbol?)")
            }
            Err(e) => tracing::warn!(series = %key, error = %e, "failed"),
        }
    }

    fn on_batch_complete(&self, summary: &CrawlSummary) {
        tracing::info!(
            series = summary.reports.len(),
            created = summary.created(),
            appended = summary.appended(),
            up_to_date = summary.up_to_date(),
            failed = summary.failed(),
            options_failures = summary.options_failures.len(),
            rows = summary.rows_written(),
            "crawl complete"
        );
    }
}

pub struct Crawler<'a> {
    client: &'a dyn MarketDataClient,
    store: &'a SeriesStore,
    options: CrawlOptions,
    pool: rayon::ThreadPool,
}

impl<'a> Crawler<'a> {
    pub fn new(
        client: &'a dyn MarketDataClient,
        store: &'a SeriesStore,
        options: CrawlOptions,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.workers.max(1))
            .thread_name(|i| format!("crawl-worker-{i}"))
            .build()?;
        Ok(Self {
            client,
            store,
            options,
            pool,
        })
    }

    /// Crawl every symbol in order and return the collected outcomes.
    pub fn run(&self, symbols: &[String], progress: &dyn CrawlProgress) -> CrawlSummary {
        let total = symbols.len();
        let reconciler = Reconciler::new(self.client, self.store);
        let mut summary = CrawlSummary::default();
        tracing::info!(
            provider = self.client.name(),
            symbols = total,
            today = %self.options.today,
            "crawl started"
        );

        for (i, symbol) in symbols.iter().enumerate() {
            // Bail out early if the circuit breaker tripped
            if !self.client.is_available() {
                tracing::error!(
                    remaining = total - i,
                    "provider unavailable, skipping remaining symbols"
                );
                for sym in &symbols[i..] {
                    summary.reports.push(SeriesReport {
                        key: SeriesKey::equity(sym.as_str()),
                        result: Err(DataError::CircuitBreakerTripped.into()),
                    });
                }
                break;
            }

            progress.on_symbol_start(symbol, i, total);
            let key = SeriesKey::equity(symbol.as_str());
            let result = reconciler.reconcile(&key, self.options.today);
            progress.on_series_complete(&key, &result);
            summary.reports.push(SeriesReport { key, result });

            if self.options.include_options {
                self.crawl_options(symbol, progress, &mut summary);
            }
        }

        progress.on_batch_complete(&summary);
        summary
    }

    fn crawl_options(&self, underlying: &str, progress: &dyn CrawlProgress, summary: &mut CrawlSummary) {
        tracing::info!(symbol = underlying, "fetching options");
        let scan = match scan_chains(self.client, self.store, underlying) {
            Ok(scan) => scan,
            Err(error) => {
                tracing::warn!(symbol = underlying, error = %error, "options listing failed");
                summary.options_failures.push(OptionsFailure {
                    underlying: underlying.to_string(),
                    expiration: None,
                    error,
                });
                return;
            }
        };

        for (expiration, error) in scan.failures {
            summary.options_failures.push(OptionsFailure {
                underlying: underlying.to_string(),
                expiration: Some(expiration),
                error,
            });
        }

        let (contracts, duplicates) = split_duplicates(scan.contracts);
        for contract in duplicates {
            tracing::error!(
                symbol = underlying,
                contract = %contract,
                "options listing repeats a contract; processing it once"
            );
            summary.reports.push(SeriesReport {
                key: SeriesKey::contract(underlying, contract.as_str()),
                result: Err(SymbolError::DuplicateContract {
                    underlying: underlying.to_string(),
                    contract,
                }),
            });
        }

        let (contracts, unsafe_names): (Vec<String>, Vec<String>) =
            contracts.into_iter().partition(|c| is_safe_name(c));
        for contract in unsafe_names {
            tracing::error!(
                symbol = underlying,
                contract = ?contract,
                "options listing has a contract symbol unusable as a file name; skipping it"
            );
            summary.reports.push(SeriesReport {
                key: SeriesKey::contract(underlying, contract.as_str()),
                result: Err(SymbolError::InvalidContract {
                    underlying: underlying.to_string(),
                    contract,
                }),
            });
        }

        if contracts.is_empty() {
            return;
        }
        progress.on_contracts_start(underlying, contracts.len());

        let today = self.options.today;
        let reports: Vec<SeriesReport> = self.pool.install(|| {
            contracts
                .par_iter()
                .map(|contract| {
                    let key = SeriesKey::contract(underlying, contract.as_str());
                    let result = Reconciler::new(self.client, self.store).reconcile(&key, today);
                    progress.on_series_complete(&key, &result);
                    SeriesReport { key, result }
                })
                .collect()
        });
        summary.reports.extend(reports);
    }
}

/// Split a sorted list into unique entries and the surplus repeats.
fn split_duplicates(sorted: Vec<String>) -> (Vec<String>, Vec<String>) {
    let mut unique: Vec<String> = Vec::with_capacity(sorted.len());
    let mut duplicates = Vec::new();
    for symbol in sorted {
        if unique.last() == Some(&symbol) {
            duplicates.push(symbol);
        } else {
            unique.push(symbol);
        }
    }
    (unique, duplicates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_duplicates_keeps_one_of_each() {
        let (unique, dups) = split_duplicates(vec![
            "A".into(),
            "B".into(),
            "B".into(),
            "B".into(),
            "C".into(),
        ]);
        assert_eq!(unique, vec!["A", "B", "C"]);
        assert_eq!(dups, vec!["B", "B"]);
    }

    #[test]
    fn summary_counts() {
        let summary = CrawlSummary {
            reports: vec![
                SeriesReport {
                    key: SeriesKey::equity("A"),
                    result: Ok(SymbolOutcome::Created {
                        path: "a".into(),
                        rows: 10,
                    }),
                },
                SeriesReport {
                    key: SeriesKey::equity("B"),
                    result: Ok(SymbolOutcome::Appended { count: 2 }),
                },
                SeriesReport {
                    key: SeriesKey::equity("C"),
                    result: Ok(SymbolOutcome::UpToDate),
                },
                SeriesReport {
                    key: SeriesKey::equity("D"),
                    result: Err(crate::data::store::StoreError::NoData { symbol: "D".into() }.into()),
                },
            ],
            options_failures: Vec::new(),
        };
        assert_eq!(summary.created(), 1);
        assert_eq!(summary.appended(), 1);
        assert_eq!(summary.up_to_date(), 1);
        assert_eq!(summary.no_data(), 1);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.rows_written(), 12);
        assert!(!summary.all_succeeded());
        assert!(summary.report(&SeriesKey::equity("C")).is_some());
    }
}
