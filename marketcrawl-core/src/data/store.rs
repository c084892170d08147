//! Append-only xz-compressed CSV store, one file per series.
//!
//! A series file is a header row followed by one row per trading day,
//! strictly ascending by date. The file is created once from a full backfill
//! and only ever grows: every append is encoded as a separate xz stream and
//! written to the end of the file, so reads use a multi-stream decoder.
//!
//! Features:
//! - Atomic creation (write to .tmp, fsync, rename into place)
//! - Appends truncated back to the previous length if the write or fsync fails
//! - Per-path locks so concurrent workers never interleave appends
//! - Watermark read by streaming the rows and keeping only the last one
//! - Ordering check on append (rows must be strictly after the watermark)

use super::layout::{DataLayout, SeriesKey};
use super::provider::{OptionQuote, PriceBar};
use chrono::NaiveDate;
use csv::StringRecord;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

/// Header of every price series file.
pub const PRICE_HEADER: [&str; 9] = [
    "Date",
    "Open",
    "High",
    "Low",
    "Close",
    "Adj Close",
    "Volume",
    "Dividends",
    "Stock Splits",
];

/// Header of every option chain snapshot file.
pub const OPTION_HEADER: [&str; 14] = [
    "contractSymbol",
    "lastTradeDate",
    "strike",
    "lastPrice",
    "bid",
    "ask",
    "change",
    "percentChange",
    "volume",
    "openInterest",
    "impliedVolatility",
    "inTheMoney",
    "contractSize",
    "currency",
];

const XZ_LEVEL: u32 = 6;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{} already exists", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("no data for {symbol} (delisted or invalid symbol?)")]
    NoData { symbol: String },

    #[error("{} does not exist", path.display())]
    NotFound { path: PathBuf },

    #[error("row dated {date} is not after {after} in {}", path.display())]
    OutOfOrder {
        path: PathBuf,
        date: NaiveDate,
        after: NaiveDate,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("CSV error in {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("corrupt series file {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        StoreError::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result of scanning a whole series file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub rows: usize,
    pub first: Option<NaiveDate>,
    pub last: Option<NaiveDate>,
    /// `(row index, date)` of every row not strictly after its predecessor.
    pub violations: Vec<(usize, NaiveDate)>,
}

impl VerifyReport {
    pub fn is_ordered(&self) -> bool {
        self.violations.is_empty()
    }
}

pub struct SeriesStore {
    layout: DataLayout,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl SeriesStore {
    pub fn new(layout: DataLayout) -> Self {
        Self {
            layout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn path(&self, key: &SeriesKey) -> PathBuf {
        self.layout.series_path(key)
    }

    pub fn exists(&self, key: &SeriesKey) -> bool {
        self.path(key).is_file()
    }

    /// Run `f` while holding the exclusive lock for `path`.
    ///
    /// The entry is dropped again once no other caller holds or waits on it,
    /// so the map only ever contains paths with work in flight.
    fn with_path_lock<T>(&self, path: &Path, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(path.to_path_buf()).or_default().clone()
        };

        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(path);
        }
        result
    }

    /// Date of the last row, or `None` if the file is missing or header-only.
    pub fn read_watermark(&self, key: &SeriesKey) -> Result<Option<NaiveDate>, StoreError> {
        let path = self.path(key);
        if !path.is_file() {
            return Ok(None);
        }
        read_last_date(&path)
    }

    /// Create the series file from a full history. Never overwrites.
    pub fn create_with_full_history(
        &self,
        key: &SeriesKey,
        bars: &[PriceBar],
    ) -> Result<PathBuf, StoreError> {
        let path = self.path(key);
        self.with_path_lock(&path, || {
            if path.exists() {
                return Err(StoreError::AlreadyExists { path: path.clone() });
            }
            if bars.is_empty() {
                return Err(StoreError::NoData {
                    symbol: key.symbol().to_string(),
                });
            }
            check_ascending(&path, bars, None)?;

            let bytes = encode_rows(&path, Some(&PRICE_HEADER[..]), bars)?;
            write_atomic(&path, &bytes)
        })?;
        Ok(path)
    }

    /// Append bars after the current watermark. Returns the number of rows written.
    ///
    /// Zero bars is a successful no-op that leaves the file untouched.
    pub fn append(&self, key: &SeriesKey, bars: &[PriceBar]) -> Result<usize, StoreError> {
        let path = self.path(key);
        if !path.is_file() {
            return Err(StoreError::NotFound { path });
        }
        if bars.is_empty() {
            return Ok(0);
        }

        self.with_path_lock(&path, || {
            let watermark = read_last_date(&path)?;
            check_ascending(&path, bars, watermark)?;

            let bytes = encode_rows(&path, None, bars)?;
            append_or_roll_back(&path, |file| file.write_all(&bytes))
        })?;

        Ok(bars.len())
    }

    /// Every row of a series, in file order.
    pub fn read_all(&self, key: &SeriesKey) -> Result<Vec<PriceBar>, StoreError> {
        let path = self.path(key);
        if !path.is_file() {
            return Err(StoreError::NotFound { path });
        }
        let mut reader = open_reader(&path)?;
        reader
            .deserialize()
            .collect::<Result<Vec<PriceBar>, _>>()
            .map_err(|e| StoreError::csv(&path, e))
    }

    /// Scan a series and report row count, date span and ordering violations.
    pub fn verify(&self, key: &SeriesKey) -> Result<VerifyReport, StoreError> {
        let path = self.path(key);
        if !path.is_file() {
            return Err(StoreError::NotFound { path });
        }
        let mut reader = open_reader(&path)?;
        let mut record = StringRecord::new();
        let mut report = VerifyReport {
            rows: 0,
            first: None,
            last: None,
            violations: Vec::new(),
        };

        while reader
            .read_record(&mut record)
            .map_err(|e| StoreError::csv(&path, e))?
        {
            let date = parse_date(&path, &record)?;
            if report.last.is_some_and(|prev| date <= prev) {
                report.violations.push((report.rows, date));
            }
            report.first.get_or_insert(date);
            report.last = Some(date);
            report.rows += 1;
        }

        Ok(report)
    }

    /// Overwrite an option chain snapshot (header written even for an empty chain).
    pub fn write_snapshot(&self, path: &Path, quotes: &[OptionQuote]) -> Result<(), StoreError> {
        self.with_path_lock(path, || {
            let bytes = encode_rows(path, Some(&OPTION_HEADER[..]), quotes)?;
            write_atomic(path, &bytes)
        })
    }
}

fn open_reader(path: &Path) -> Result<csv::Reader<XzDecoder<BufReader<File>>>, StoreError> {
    let file = File::open(path).map_err(|e| StoreError::io(path, e))?;
    let decoder = XzDecoder::new_multi_decoder(BufReader::new(file));
    Ok(csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(decoder))
}

fn read_last_date(path: &Path) -> Result<Option<NaiveDate>, StoreError> {
    let mut reader = open_reader(path)?;
    let mut current = StringRecord::new();
    let mut last = StringRecord::new();
    let mut seen = false;

    while reader
        .read_record(&mut current)
        .map_err(|e| StoreError::csv(path, e))?
    {
        std::mem::swap(&mut current, &mut last);
        seen = true;
    }

    if !seen {
        return Ok(None);
    }
    parse_date(path, &last).map(Some)
}

fn parse_date(path: &Path, record: &StringRecord) -> Result<NaiveDate, StoreError> {
    let field = record.get(0).ok_or_else(|| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: "empty row".into(),
    })?;
    NaiveDate::parse_from_str(field, "%Y-%m-%d").map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: format!("bad date '{field}': {e}"),
    })
}

fn check_ascending(
    path: &Path,
    bars: &[PriceBar],
    watermark: Option<NaiveDate>,
) -> Result<(), StoreError> {
    let mut prev = watermark;
    for bar in bars {
        if let Some(after) = prev {
            if bar.date <= after {
                return Err(StoreError::OutOfOrder {
                    path: path.to_path_buf(),
                    date: bar.date,
                    after,
                });
            }
        }
        prev = Some(bar.date);
    }
    Ok(())
}

/// Encode rows as one complete xz stream.
fn encode_rows<T: Serialize>(
    path: &Path,
    header: Option<&[&str]>,
    rows: &[T],
) -> Result<Vec<u8>, StoreError> {
    let encoder = XzEncoder::new(Vec::new(), XZ_LEVEL);
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(encoder);

    if let Some(header) = header {
        writer
            .write_record(header)
            .map_err(|e| StoreError::csv(path, e))?;
    }
    for row in rows {
        writer.serialize(row).map_err(|e| StoreError::csv(path, e))?;
    }

    let encoder = writer
        .into_inner()
        .map_err(|e| StoreError::io(path, e.into_error()))?;
    encoder.finish().map_err(|e| StoreError::io(path, e))
}

/// Run `write` against `path` opened for append, then fsync.
///
/// On failure the file is truncated back to its previous length, so a torn
/// xz stream never stays behind the last complete one.
fn append_or_roll_back(
    path: &Path,
    write: impl FnOnce(&mut File) -> io::Result<()>,
) -> Result<(), StoreError> {
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e))?;
    let original_len = file
        .metadata()
        .map_err(|e| StoreError::io(path, e))?
        .len();

    let written = write(&mut file).and_then(|()| file.sync_all());
    if let Err(e) = written {
        if let Err(undo) = file.set_len(original_len).and_then(|()| file.sync_all()) {
            tracing::error!(
                path = %path.display(),
                error = %undo,
                "could not roll back partial append; series needs repair"
            );
        }
        return Err(StoreError::io(path, e));
    }
    Ok(())
}

/// Write `bytes` to `path` via a fsynced temp file and rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }

    let tmp_path = path.with_extension("xz.tmp");
    let written = File::create(&tmp_path).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(StoreError::io(&tmp_path, e));
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        StoreError::io(path, e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn bar(d: u32) -> PriceBar {
        let close = 100.0 + d as f64;
        PriceBar::ohlcv(day(d), close - 0.5, close + 1.0, close - 1.0, close, 1000 + d as u64)
    }

    fn store() -> (tempfile::TempDir, SeriesStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SeriesStore::new(DataLayout::new(dir.path()));
        (dir, store)
    }

    #[test]
    fn missing_file_has_no_watermark() {
        let (_dir, store) = store();
        let key = SeriesKey::equity("SPY");
        assert!(!store.exists(&key));
        assert_eq!(store.read_watermark(&key).unwrap(), None);
    }

    #[test]
    fn create_then_watermark_is_last_date() {
        let (_dir, store) = store();
        let key = SeriesKey::equity("SPY");
        let path = store
            .create_with_full_history(&key, &[bar(2), bar(3), bar(4)])
            .unwrap();

        assert!(path.ends_with("stocks/SPY.csv.xz"));
        assert!(store.exists(&key));
        assert_eq!(store.read_watermark(&key).unwrap(), Some(day(4)));
        assert!(!path.with_extension("xz.tmp").exists());
    }

    #[test]
    fn create_twice_fails_and_leaves_file_alone() {
        let (_dir, store) = store();
        let key = SeriesKey::equity("SPY");
        let path = store.create_with_full_history(&key, &[bar(2)]).unwrap();
        let before = fs::read(&path).unwrap();

        let err = store
            .create_with_full_history(&key, &[bar(2), bar(3)])
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn create_with_no_rows_is_no_data() {
        let (_dir, store) = store();
        let key = SeriesKey::equity("DEAD");
        let err = store.create_with_full_history(&key, &[]).unwrap_err();
        assert!(matches!(err, StoreError::NoData { ref symbol } if symbol == "DEAD"));
        assert!(!store.exists(&key));
    }

    #[test]
    fn append_requires_existing_file() {
        let (_dir, store) = store();
        let err = store
            .append(&SeriesKey::equity("SPY"), &[bar(2)])
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn append_nothing_is_a_noop() {
        let (_dir, store) = store();
        let key = SeriesKey::equity("SPY");
        let path = store.create_with_full_history(&key, &[bar(2)]).unwrap();
        let before = fs::read(&path).unwrap();

        assert_eq!(store.append(&key, &[]).unwrap(), 0);
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn append_extends_without_repeating_header() {
        let (_dir, store) = store();
        let key = SeriesKey::equity("SPY");
        store.create_with_full_history(&key, &[bar(2), bar(3)]).unwrap();
        assert_eq!(store.append(&key, &[bar(4)]).unwrap(), 1);
        assert_eq!(store.append(&key, &[bar(5), bar(8)]).unwrap(), 2);

        let rows = store.read_all(&key).unwrap();
        let dates: Vec<_> = rows.iter().map(|b| b.date).collect();
        assert_eq!(dates, vec![day(2), day(3), day(4), day(5), day(8)]);
        assert_eq!(rows[4], bar(8));
        assert_eq!(store.read_watermark(&key).unwrap(), Some(day(8)));
    }

    #[test]
    fn append_rejects_rows_at_or_before_watermark() {
        let (_dir, store) = store();
        let key = SeriesKey::equity("SPY");
        let path = store.create_with_full_history(&key, &[bar(2), bar(3)]).unwrap();
        let before = fs::read(&path).unwrap();

        let err = store.append(&key, &[bar(3)]).unwrap_err();
        assert!(matches!(err, StoreError::OutOfOrder { date, .. } if date == day(3)));
        let err = store.append(&key, &[bar(5), bar(4)]).unwrap_err();
        assert!(matches!(err, StoreError::OutOfOrder { .. }));
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn header_only_file_has_no_watermark() {
        let (_dir, store) = store();
        let key = SeriesKey::equity("EMPTY");
        let path = store.path(&key);
        let bytes = encode_rows::<PriceBar>(&path, Some(&PRICE_HEADER[..]), &[]).unwrap();
        write_atomic(&path, &bytes).unwrap();

        assert!(store.exists(&key));
        assert_eq!(store.read_watermark(&key).unwrap(), None);
    }

    #[test]
    fn garbage_trailing_date_is_corrupt() {
        let (_dir, store) = store();
        let key = SeriesKey::equity("BAD");
        let path = store.path(&key);
        let bytes = encode_rows(&path, Some(&["Date", "Close"][..]), &[("not-a-date", 1.0)]).unwrap();
        write_atomic(&path, &bytes).unwrap();

        let err = store.read_watermark(&key).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn verify_reports_span_and_order() {
        let (_dir, store) = store();
        let key = SeriesKey::contract("AAPL", "AAPL240621C00150000");
        store.create_with_full_history(&key, &[bar(2), bar(3)]).unwrap();
        store.append(&key, &[bar(9)]).unwrap();

        let report = store.verify(&key).unwrap();
        assert_eq!(report.rows, 3);
        assert_eq!(report.first, Some(day(2)));
        assert_eq!(report.last, Some(day(9)));
        assert!(report.is_ordered());
    }

    #[test]
    fn verify_flags_out_of_order_rows() {
        let (_dir, store) = store();
        let key = SeriesKey::equity("MESS");
        let path = store.path(&key);
        let bytes = encode_rows(&path, Some(&PRICE_HEADER[..]), &[bar(3), bar(2), bar(2)]).unwrap();
        write_atomic(&path, &bytes).unwrap();

        let report = store.verify(&key).unwrap();
        assert_eq!(report.rows, 3);
        assert_eq!(report.violations, vec![(1, day(2)), (2, day(2))]);
    }

    #[test]
    fn snapshot_is_overwritten() {
        let (dir, store) = store();
        let path = dir.path().join("options/AAPL/summary/calls-2024-06-21.csv.xz");
        let quote = OptionQuote {
            contract_symbol: "AAPL240621C00150000".into(),
            last_trade_date: None,
            strike: 150.0,
            last_price: Some(40.1),
            bid: Some(40.0),
            ask: Some(40.3),
            change: None,
            percent_change: None,
            volume: Some(12),
            open_interest: Some(300),
            implied_volatility: Some(0.31),
            in_the_money: true,
            contract_size: Some("REGULAR".into()),
            currency: Some("USD".into()),
        };

        store.write_snapshot(&path, &[quote.clone(), quote]).unwrap();
        store.write_snapshot(&path, &[]).unwrap();

        let mut reader = open_reader(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.iter().collect::<Vec<_>>(), OPTION_HEADER.to_vec());
        assert_eq!(reader.records().count(), 0);
    }

    #[test]
    fn failed_append_is_rolled_back() {
        let (_dir, store) = store();
        let key = SeriesKey::equity("SPY");
        let path = store.create_with_full_history(&key, &[bar(2)]).unwrap();
        let before = fs::read(&path).unwrap();

        // Half a stream, then the disk fills up.
        let stream = encode_rows(&path, None, &[bar(3)]).unwrap();
        let result = append_or_roll_back(&path, |file| {
            file.write_all(&stream[..stream.len() / 2])?;
            Err(io::Error::new(io::ErrorKind::Other, "no space left on device"))
        });

        assert!(matches!(result, Err(StoreError::Io { .. })));
        assert_eq!(fs::read(&path).unwrap(), before);
        assert_eq!(store.read_watermark(&key).unwrap(), Some(day(2)));
        assert_eq!(store.append(&key, &[bar(3)]).unwrap(), 1);
        assert_eq!(store.read_watermark(&key).unwrap(), Some(day(3)));
    }

    #[test]
    fn path_locks_are_released_after_use() {
        let (_dir, store) = store();
        let key = SeriesKey::equity("SPY");
        store.create_with_full_history(&key, &[bar(2)]).unwrap();
        store.append(&key, &[bar(3)]).unwrap();
        let _ = store.append(&key, &[bar(1)]);
        assert!(store.locks.lock().unwrap().is_empty());
    }

    #[test]
    fn concurrent_appends_keep_file_ordered() {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let key = SeriesKey::equity("SPY");
        store.create_with_full_history(&key, &[bar(1)]).unwrap();

        let handles: Vec<_> = (2..=20)
            .map(|d| {
                let store = store.clone();
                let key = key.clone();
                std::thread::spawn(move || store.append(&key, &[bar(d)]).is_ok())
            })
            .collect();
        let appended = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        let report = store.verify(&key).unwrap();
        assert!(report.is_ordered());
        assert_eq!(report.rows, appended + 1);
        assert!(store.locks.lock().unwrap().is_empty());
    }
}
