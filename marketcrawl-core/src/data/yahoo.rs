//! Yahoo Finance market data client.
//!
//! Daily bars come from the v8 chart API (with dividend and split events and
//! adjusted closes), option listings and chains from the v7 options API.
//! Handles retries with exponential backoff and jitter, the shared circuit
//! breaker, the on-disk response cache, and the cookie/crumb handshake the
//! options endpoint requires.
//!
//! Yahoo Finance has no official API and is subject to unannounced format changes.

use super::circuit_breaker::CircuitBreaker;
use super::http_cache::HttpCache;
use super::provider::{DataError, MarketDataClient, OptionChain, OptionQuote, PriceBar};
use chrono::{DateTime, NaiveDate, NaiveTime};
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Page that hands out the session cookie the crumb endpoint needs.
const COOKIE_URL: &str = "https://fc.yahoo.com";

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    meta: Option<ChartMeta>,
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
    events: Option<Events>,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    gmtoffset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
    adjclose: Option<Vec<AdjCloseData>>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<u64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseData {
    adjclose: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct Events {
    dividends: Option<HashMap<String, DividendEvent>>,
    splits: Option<HashMap<String, SplitEvent>>,
}

#[derive(Debug, Deserialize)]
struct DividendEvent {
    amount: f64,
    date: i64,
}

#[derive(Debug, Deserialize)]
struct SplitEvent {
    date: i64,
    numerator: f64,
    denominator: f64,
}

#[derive(Debug, Deserialize)]
struct OptionsResponse {
    #[serde(rename = "optionChain")]
    option_chain: OptionsResult,
}

#[derive(Debug, Deserialize)]
struct OptionsResult {
    result: Option<Vec<OptionsData>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OptionsData {
    #[serde(default)]
    expiration_dates: Vec<i64>,
    #[serde(default)]
    options: Vec<OptionsBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OptionsBlock {
    expiration_date: Option<i64>,
    #[serde(default)]
    calls: Vec<YahooQuote>,
    #[serde(default)]
    puts: Vec<YahooQuote>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YahooQuote {
    contract_symbol: String,
    strike: f64,
    currency: Option<String>,
    last_price: Option<f64>,
    change: Option<f64>,
    percent_change: Option<f64>,
    volume: Option<u64>,
    open_interest: Option<u64>,
    bid: Option<f64>,
    ask: Option<f64>,
    contract_size: Option<String>,
    last_trade_date: Option<i64>,
    implied_volatility: Option<f64>,
    in_the_money: Option<bool>,
}

impl From<YahooQuote> for OptionQuote {
    fn from(q: YahooQuote) -> Self {
        OptionQuote {
            contract_symbol: q.contract_symbol,
            last_trade_date: q.last_trade_date.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            strike: q.strike,
            last_price: q.last_price,
            bid: q.bid,
            ask: q.ask,
            change: q.change,
            percent_change: q.percent_change,
            volume: q.volume,
            open_interest: q.open_interest,
            implied_volatility: q.implied_volatility,
            in_the_money: q.in_the_money.unwrap_or(false),
            contract_size: q.contract_size,
            currency: q.currency,
        }
    }
}

/// Connection settings for the Yahoo client.
#[derive(Debug, Clone)]
pub struct YahooConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for YahooConfig {
    fn default() -> Self {
        Self {
            base_url: "https://query2.finance.yahoo.com".into(),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/91.0.4472.114 Safari/537.36"
                .into(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

pub struct YahooProvider {
    client: reqwest::blocking::Client,
    config: YahooConfig,
    circuit_breaker: Arc<CircuitBreaker>,
    cache: Option<Arc<HttpCache>>,
    crumb: Mutex<Option<String>>,
}

impl YahooProvider {
    pub fn new(
        config: YahooConfig,
        circuit_breaker: Arc<CircuitBreaker>,
        cache: Option<Arc<HttpCache>>,
    ) -> Result<Self, DataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .cookie_store(true)
            .build()
            .map_err(|e| DataError::NetworkUnreachable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            circuit_breaker,
            cache,
            crumb: Mutex::new(None),
        })
    }

    fn chart_full_url(&self, symbol: &str) -> String {
        format!(
            "{}/v8/finance/chart/{}?range=max&interval=1d&events=div%2Csplits&includeAdjustedClose=true",
            self.config.base_url,
            encode_symbol(symbol)
        )
    }

    /// Chart URL for `[begin, end)`: both bounds are UTC midnights.
    fn chart_range_url(&self, symbol: &str, begin: NaiveDate, end: NaiveDate) -> String {
        format!(
            "{}/v8/finance/chart/{}?period1={}&period2={}&interval=1d&events=div%2Csplits\
             &includeAdjustedClose=true",
            self.config.base_url,
            encode_symbol(symbol),
            midnight_ts(begin),
            midnight_ts(end)
        )
    }

    fn options_url(&self, symbol: &str, expiration: Option<NaiveDate>) -> String {
        let mut url = format!(
            "{}/v7/finance/options/{}",
            self.config.base_url,
            encode_symbol(symbol)
        );
        if let Some(exp) = expiration {
            url.push_str(&format!("?date={}", midnight_ts(exp)));
        }
        url
    }

    /// Parse the chart API response into bars. "Not Found" means no rows.
    fn parse_chart(symbol: &str, resp: ChartResponse) -> Result<Vec<PriceBar>, DataError> {
        let result = match resp.chart.result {
            Some(result) => result,
            None => {
                return match resp.chart.error {
                    Some(err) if err.code == "Not Found" => {
                        tracing::debug!(symbol, reason = %err.description, "no chart data");
                        Ok(Vec::new())
                    }
                    Some(err) => Err(DataError::ResponseFormatChanged(format!(
                        "{}: {}",
                        err.code, err.description
                    ))),
                    None => Err(DataError::ResponseFormatChanged(
                        "empty result with no error".into(),
                    )),
                };
            }
        };

        let Some(data) = result.into_iter().next() else {
            return Ok(Vec::new());
        };
        let Some(timestamps) = data.timestamp else {
            return Ok(Vec::new());
        };

        let offset = data.meta.and_then(|m| m.gmtoffset).unwrap_or(0);
        let to_date = |ts: i64| {
            DateTime::from_timestamp(ts + offset, 0)
                .map(|dt| dt.date_naive())
                .ok_or_else(|| DataError::ResponseFormatChanged(format!("invalid timestamp: {ts}")))
        };

        let quote = data
            .indicators
            .quote
            .into_iter()
            .next()
            .ok_or_else(|| DataError::ResponseFormatChanged("no quote data".into()))?;

        let adj_closes = data
            .indicators
            .adjclose
            .and_then(|v| v.into_iter().next())
            .map(|a| a.adjclose);

        let mut dividends: HashMap<NaiveDate, f64> = HashMap::new();
        let mut splits: HashMap<NaiveDate, f64> = HashMap::new();
        if let Some(events) = data.events {
            for ev in events.dividends.unwrap_or_default().into_values() {
                *dividends.entry(to_date(ev.date)?).or_default() += ev.amount;
            }
            for ev in events.splits.unwrap_or_default().into_values() {
                if ev.denominator != 0.0 {
                    splits.insert(to_date(ev.date)?, ev.numerator / ev.denominator);
                }
            }
        }

        let mut bars = Vec::with_capacity(timestamps.len());
        for (i, &ts) in timestamps.iter().enumerate() {
            let date = to_date(ts)?;

            let open = quote.open.get(i).copied().flatten();
            let high = quote.high.get(i).copied().flatten();
            let low = quote.low.get(i).copied().flatten();
            let close = quote.close.get(i).copied().flatten();
            let volume = quote.volume.get(i).copied().flatten();
            let adj_close = adj_closes
                .as_ref()
                .and_then(|v| v.get(i).copied().flatten());

            // Holidays and halted days come back as all-null rows
            if open.is_none()
                && high.is_none()
                && low.is_none()
                && close.is_none()
                && volume.is_none()
            {
                continue;
            }

            let close = close.unwrap_or(f64::NAN);
            bars.push(PriceBar {
                date,
                open: open.unwrap_or(f64::NAN),
                high: high.unwrap_or(f64::NAN),
                low: low.unwrap_or(f64::NAN),
                close,
                adj_close: adj_close.unwrap_or(close),
                volume: volume.unwrap_or(0),
                dividends: dividends.get(&date).copied().unwrap_or(0.0),
                stock_splits: splits.get(&date).copied().unwrap_or(0.0),
            });
        }

        Ok(bars)
    }

    fn parse_options(symbol: &str, resp: OptionsResponse) -> Result<OptionsData, DataError> {
        if let Some(err) = resp.option_chain.error {
            return Err(if err.code == "Not Found" {
                DataError::SymbolNotFound {
                    symbol: symbol.to_string(),
                }
            } else {
                DataError::ResponseFormatChanged(format!("{}: {}", err.code, err.description))
            });
        }
        Ok(resp
            .option_chain
            .result
            .and_then(|r| r.into_iter().next())
            .unwrap_or(OptionsData {
                expiration_dates: Vec::new(),
                options: Vec::new(),
            }))
    }

    fn parse_expirations(data: &OptionsData) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = data
            .expiration_dates
            .iter()
            .filter_map(|&ts| DateTime::from_timestamp(ts, 0))
            .map(|dt| dt.date_naive())
            .collect();
        dates.sort();
        dates.dedup();
        dates
    }

    fn parse_chain(data: OptionsData, expiration: NaiveDate) -> OptionChain {
        let block = data.options.into_iter().find(|b| {
            b.expiration_date
                .and_then(|ts| DateTime::from_timestamp(ts, 0))
                .map_or(true, |dt| dt.date_naive() == expiration)
        });
        match block {
            Some(block) => OptionChain {
                calls: block.calls.into_iter().map(OptionQuote::from).collect(),
                puts: block.puts.into_iter().map(OptionQuote::from).collect(),
            },
            None => OptionChain::default(),
        }
    }

    /// Lazily perform the cookie + crumb handshake.
    fn crumb(&self) -> Result<String, DataError> {
        let mut crumb = self.crumb.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(c) = crumb.as_ref() {
            return Ok(c.clone());
        }

        // Sets the session cookie; the response status itself is irrelevant.
        let _ = self.client.get(COOKIE_URL).send();

        let url = format!("{}/v1/test/getcrumb", self.config.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| DataError::NetworkUnreachable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(DataError::AuthenticationRequired(format!(
                "crumb request returned HTTP {}",
                resp.status()
            )));
        }
        let text = resp
            .text()
            .map_err(|e| DataError::NetworkUnreachable(e.to_string()))?;
        let text = text.trim().to_string();
        if text.is_empty() || text.contains('<') {
            return Err(DataError::AuthenticationRequired(
                "crumb endpoint returned no crumb".into(),
            ));
        }
        *crumb = Some(text.clone());
        Ok(text)
    }

    /// Response body for `url`, from the cache when fresh.
    ///
    /// The cache key never includes the crumb, which changes between sessions.
    fn get_body(&self, symbol: &str, url: &str, with_crumb: bool) -> Result<String, DataError> {
        if let Some(body) = self.cache.as_ref().and_then(|c| c.get(url)) {
            tracing::trace!(symbol, url, "http cache hit");
            return Ok(body);
        }

        let request_url = if with_crumb {
            let sep = if url.contains('?') { '&' } else { '?' };
            format!("{url}{sep}crumb={}", self.crumb()?)
        } else {
            url.to_string()
        };

        let (body, cacheable) = self.fetch_with_retry(symbol, &request_url)?;
        if cacheable {
            if let Some(cache) = &self.cache {
                if let Err(e) = cache.put(url, &body) {
                    tracing::warn!(symbol, error = %e, "failed to cache response");
                }
            }
        }
        Ok(body)
    }

    /// Execute a GET with retry and circuit breaker logic.
    ///
    /// Returns the body and whether it is a success worth caching. A 404 body is
    /// returned uncached because Yahoo reports unknown symbols inside it.
    fn fetch_with_retry(&self, symbol: &str, url: &str) -> Result<(String, bool), DataError> {
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = self.backoff(attempt, last_error.as_ref());
                tracing::debug!(symbol, attempt, ?delay, "retrying after backoff");
                std::thread::sleep(delay);
            }

            self.check_breaker(symbol)?;

            match self.fetch_once(symbol, url) {
                Ok(fetched) => {
                    self.circuit_breaker.record_success();
                    return Ok(fetched);
                }
                Err(e) if e.is_transient() => {
                    self.circuit_breaker.record_failure();
                    tracing::debug!(symbol, attempt, error = %e, "transient failure");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| DataError::NetworkUnreachable("max retries exceeded".into())))
    }

    fn check_breaker(&self, symbol: &str) -> Result<(), DataError> {
        if self.circuit_breaker.is_allowed() {
            return Ok(());
        }
        tracing::debug!(
            symbol,
            cooldown = ?self.circuit_breaker.remaining_cooldown(),
            "circuit breaker open"
        );
        Err(DataError::CircuitBreakerTripped)
    }

    /// One GET, classified. Transient errors are left for the caller to retry.
    fn fetch_once(&self, symbol: &str, url: &str) -> Result<(String, bool), DataError> {
        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| DataError::NetworkUnreachable(e.to_string()))?;
        let status = resp.status();

        if status == reqwest::StatusCode::FORBIDDEN {
            self.circuit_breaker.trip();
            return Err(DataError::CircuitBreakerTripped);
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(DataError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if status == reqwest::StatusCode::UNAUTHORIZED {
            // Stale crumb: force a new handshake next time.
            *self.crumb.lock().unwrap_or_else(PoisonError::into_inner) = None;
            return Err(DataError::AuthenticationRequired(format!(
                "Yahoo Finance refused {symbol} (HTTP 401)"
            )));
        }

        let not_found = status == reqwest::StatusCode::NOT_FOUND;
        if !status.is_success() && !not_found {
            return Err(DataError::Http {
                status: status.as_u16(),
                symbol: symbol.to_string(),
            });
        }

        let body = resp
            .text()
            .map_err(|e| DataError::NetworkUnreachable(e.to_string()))?;
        Ok((body, !not_found))
    }

    fn backoff(&self, attempt: u32, last_error: Option<&DataError>) -> Duration {
        let exp = self.config.base_delay * 2u32.saturating_pow(attempt - 1);
        let jitter_cap = (self.config.base_delay.as_millis() as u64 / 2).max(1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap));
        match last_error {
            // Honor Retry-After, but never stall a worker for more than a minute.
            Some(DataError::RateLimited { retry_after_secs }) => {
                exp.max(Duration::from_secs((*retry_after_secs).min(60)))
            }
            _ => exp + jitter,
        }
    }

    fn get_options_data(
        &self,
        symbol: &str,
        expiration: Option<NaiveDate>,
    ) -> Result<OptionsData, DataError> {
        let url = self.options_url(symbol, expiration);
        let body = self.get_body(symbol, &url, true)?;
        let resp: OptionsResponse = serde_json::from_str(&body).map_err(|e| {
            DataError::ResponseFormatChanged(format!("failed to parse options for {symbol}: {e}"))
        })?;
        Self::parse_options(symbol, resp)
    }

    fn get_chart(&self, symbol: &str, url: &str) -> Result<Vec<PriceBar>, DataError> {
        let body = self.get_body(symbol, url, false)?;
        let chart: ChartResponse = serde_json::from_str(&body).map_err(|e| {
            DataError::ResponseFormatChanged(format!("failed to parse response for {symbol}: {e}"))
        })?;
        Self::parse_chart(symbol, chart)
    }
}

impl MarketDataClient for YahooProvider {
    fn name(&self) -> &str {
        "yahoo_finance"
    }

    fn get_full_history(&self, symbol: &str) -> Result<Vec<PriceBar>, DataError> {
        let url = self.chart_full_url(symbol);
        self.get_chart(symbol, &url)
    }

    fn get_history(
        &self,
        symbol: &str,
        begin: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>, DataError> {
        let url = self.chart_range_url(symbol, begin, end);
        let bars = self.get_chart(symbol, &url)?;
        // Yahoo sometimes includes the live bar past period2.
        Ok(bars
            .into_iter()
            .filter(|b| b.date >= begin && b.date < end)
            .collect())
    }

    fn list_option_expirations(&self, symbol: &str) -> Result<Vec<NaiveDate>, DataError> {
        let data = self.get_options_data(symbol, None)?;
        Ok(Self::parse_expirations(&data))
    }

    fn get_option_chain(
        &self,
        symbol: &str,
        expiration: NaiveDate,
    ) -> Result<OptionChain, DataError> {
        let data = self.get_options_data(symbol, Some(expiration))?;
        Ok(Self::parse_chain(data, expiration))
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}

fn midnight_ts(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

/// Percent-encode a ticker for use as a URL path segment (`^GSPC`, `ES=F`).
fn encode_symbol(symbol: &str) -> String {
    let mut out = String::with_capacity(symbol.len());
    for b in symbol.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}
