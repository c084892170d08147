//! Scripted in-memory market data client shared by the integration tests.

#![allow(dead_code)]

use chrono::NaiveDate;
use marketcrawl_core::data::{DataError, MarketDataClient, OptionChain, OptionQuote, PriceBar};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn bar(date: NaiveDate, close: f64) -> PriceBar {
    PriceBar::ohlcv(date, close - 0.5, close + 1.0, close - 1.0, close, 1_000)
}

pub fn quote(contract: &str, strike: f64, itm: bool) -> OptionQuote {
    OptionQuote {
        contract_symbol: contract.to_string(),
        last_trade_date: None,
        strike,
        last_price: Some(1.25),
        bid: Some(1.2),
        ask: Some(1.3),
        change: None,
        percent_change: None,
        volume: Some(10),
        open_interest: Some(100),
        implied_volatility: Some(0.3),
        in_the_money: itm,
        contract_size: Some("REGULAR".into()),
        currency: Some("USD".into()),
    }
}

#[derive(Default)]
pub struct ScriptedClient {
    history: Mutex<HashMap<String, Vec<PriceBar>>>,
    chains: Mutex<HashMap<String, Vec<(NaiveDate, OptionChain)>>>,
    failing: Mutex<HashSet<String>>,
    trips_breaker: Mutex<HashSet<String>>,
    /// Bars dated on or after this are not visible yet.
    visible_until: Mutex<Option<NaiveDate>>,
    /// Ranged fetches also resend the bar just before the range.
    resend_previous: AtomicBool,
    unavailable: AtomicBool,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(self, symbol: &str, bars: Vec<PriceBar>) -> Self {
        self.push_bars(symbol, bars);
        self
    }

    pub fn with_chain(self, symbol: &str, expiration: NaiveDate, chain: OptionChain) -> Self {
        self.chains
            .lock()
            .unwrap()
            .entry(symbol.to_string())
            .or_default()
            .push((expiration, chain));
        self
    }

    pub fn failing(self, symbol: &str) -> Self {
        self.failing.lock().unwrap().insert(symbol.to_string());
        self
    }

    pub fn tripping(self, symbol: &str) -> Self {
        self.trips_breaker.lock().unwrap().insert(symbol.to_string());
        self
    }

    pub fn resending_previous(self) -> Self {
        self.resend_previous.store(true, Ordering::SeqCst);
        self
    }

    pub fn push_bars(&self, symbol: &str, bars: Vec<PriceBar>) {
        self.history
            .lock()
            .unwrap()
            .entry(symbol.to_string())
            .or_default()
            .extend(bars);
    }

    /// Replace a symbol's whole history, e.g. after the provider revises a bar.
    pub fn replace_bars(&self, symbol: &str, bars: Vec<PriceBar>) {
        self.history
            .lock()
            .unwrap()
            .insert(symbol.to_string(), bars);
    }

    pub fn set_visible_until(&self, date: NaiveDate) {
        *self.visible_until.lock().unwrap() = Some(date);
    }

    pub fn calls_for(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn check(&self, symbol: &str) -> Result<(), DataError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DataError::CircuitBreakerTripped);
        }
        if self.trips_breaker.lock().unwrap().contains(symbol) {
            self.unavailable.store(true, Ordering::SeqCst);
            return Err(DataError::CircuitBreakerTripped);
        }
        if self.failing.lock().unwrap().contains(symbol) {
            return Err(DataError::NetworkUnreachable(format!("scripted failure for {symbol}")));
        }
        Ok(())
    }

    fn visible(&self, symbol: &str) -> Vec<PriceBar> {
        let limit = *self.visible_until.lock().unwrap();
        self.history
            .lock()
            .unwrap()
            .get(symbol)
            .map(|bars| {
                bars.iter()
                    .filter(|b| limit.map_or(true, |l| b.date < l))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl MarketDataClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    fn get_full_history(&self, symbol: &str) -> Result<Vec<PriceBar>, DataError> {
        self.record(format!("full:{symbol}"));
        self.check(symbol)?;
        Ok(self.visible(symbol))
    }

    fn get_history(
        &self,
        symbol: &str,
        begin: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>, DataError> {
        self.record(format!("range:{symbol}:{begin}:{end}"));
        self.check(symbol)?;
        let mut bars: Vec<PriceBar> = self
            .visible(symbol)
            .into_iter()
            .filter(|b| b.date >= begin && b.date < end)
            .collect();
        if self.resend_previous.load(Ordering::SeqCst) {
            if let Some(prev) = self
                .visible(symbol)
                .into_iter()
                .filter(|b| b.date < begin)
                .max_by_key(|b| b.date)
            {
                bars.insert(0, prev);
            }
        }
        Ok(bars)
    }

    fn list_option_expirations(&self, symbol: &str) -> Result<Vec<NaiveDate>, DataError> {
        self.record(format!("expirations:{symbol}"));
        self.check(symbol)?;
        Ok(self
            .chains
            .lock()
            .unwrap()
            .get(symbol)
            .map(|c| c.iter().map(|(exp, _)| *exp).collect())
            .unwrap_or_default())
    }

    fn get_option_chain(
        &self,
        symbol: &str,
        expiration: NaiveDate,
    ) -> Result<OptionChain, DataError> {
        self.record(format!("chain:{symbol}:{expiration}"));
        self.check(symbol)?;
        Ok(self
            .chains
            .lock()
            .unwrap()
            .get(symbol)
            .and_then(|c| c.iter().find(|(exp, _)| *exp == expiration))
            .map(|(_, chain)| chain.clone())
            .unwrap_or_default())
    }

    fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }
}
