//! Option chain snapshots and in-the-money contract selection.

use super::layout::OptionSide;
use super::provider::{DataError, MarketDataClient, OptionChain, OptionQuote};
use super::store::{SeriesStore, StoreError};
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("options listing failed: {0}")]
    Fetch(#[from] DataError),

    #[error("snapshot write failed: {0}")]
    Store(#[from] StoreError),
}

/// Contracts selected for history tracking, plus per-expiration failures.
#[derive(Debug, Default)]
pub struct ChainScan {
    /// Sorted; may contain duplicates if the provider listed a contract twice.
    pub contracts: Vec<String>,
    pub failures: Vec<(NaiveDate, OptionsError)>,
}

/// In-the-money contract symbols: calls first, then puts.
pub fn select_in_the_money(chain: &OptionChain) -> Vec<String> {
    let itm = |quotes: &[OptionQuote]| -> Vec<String> {
        quotes
            .iter()
            .filter(|q| q.in_the_money)
            .map(|q| q.contract_symbol.clone())
            .collect()
    };
    let mut symbols = itm(&chain.calls);
    symbols.extend(itm(&chain.puts));
    symbols
}

/// Snapshot every listed expiration of `underlying` and collect its ITM contracts.
///
/// A failing expiration is recorded and skipped; only a failing listing aborts
/// the scan.
pub fn scan_chains(
    client: &dyn MarketDataClient,
    store: &SeriesStore,
    underlying: &str,
) -> Result<ChainScan, OptionsError> {
    let expirations = client.list_option_expirations(underlying)?;
    let mut scan = ChainScan::default();
    if expirations.is_empty() {
        tracing::info!(symbol = underlying, "no listed options");
        return Ok(scan);
    }

    for expiration in expirations {
        match snapshot_expiration(client, store, underlying, expiration) {
            Ok(chain) => {
                let selected = select_in_the_money(&chain);
                let itm_calls = chain.calls.iter().filter(|q| q.in_the_money).count();
                let itm_puts = selected.len() - itm_calls;
                tracing::info!(
                    symbol = underlying,
                    %expiration,
                    itm_calls,
                    itm_puts,
                    "{underlying} {expiration} has {itm_calls} calls and {itm_puts} puts in the money"
                );
                scan.contracts.extend(selected);
            }
            Err(e) => {
                tracing::warn!(symbol = underlying, %expiration, error = %e, "chain scan failed");
                scan.failures.push((expiration, e));
            }
        }

        if !client.is_available() {
            break;
        }
    }

    scan.contracts.sort();
    Ok(scan)
}

fn snapshot_expiration(
    client: &dyn MarketDataClient,
    store: &SeriesStore,
    underlying: &str,
    expiration: NaiveDate,
) -> Result<OptionChain, OptionsError> {
    let chain = client.get_option_chain(underlying, expiration)?;
    let layout = store.layout();
    store.write_snapshot(
        &layout.summary_path(underlying, expiration, OptionSide::Call),
        &chain.calls,
    )?;
    store.write_snapshot(
        &layout.summary_path(underlying, expiration, OptionSide::Put),
        &chain.puts,
    )?;
    Ok(chain)
}
