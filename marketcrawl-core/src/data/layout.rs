//! On-disk layout of the data directory.
//!
//! ```text
//! {root}/stocks/{SYMBOL}.csv.xz
//! {root}/options/{SYMBOL}/summary/calls-{EXPIRATION}.csv.xz
//! {root}/options/{SYMBOL}/summary/puts-{EXPIRATION}.csv.xz
//! {root}/options/{SYMBOL}/history/{CONTRACT}.csv.xz
//! ```

use chrono::NaiveDate;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const SERIES_EXTENSION: &str = ".csv.xz";

/// Whether `name` is usable as a single path component under the data root.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name.trim() == name
        && !name.contains(['/', '\\'])
        && !name.contains("..")
}

/// Identifies one append-only series in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SeriesKey {
    Equity(String),
    OptionContract { underlying: String, contract: String },
}

impl SeriesKey {
    pub fn equity(symbol: impl Into<String>) -> Self {
        SeriesKey::Equity(symbol.into())
    }

    pub fn contract(underlying: impl Into<String>, contract: impl Into<String>) -> Self {
        SeriesKey::OptionContract {
            underlying: underlying.into(),
            contract: contract.into(),
        }
    }

    /// The symbol the market data client is queried with.
    pub fn symbol(&self) -> &str {
        match self {
            SeriesKey::Equity(symbol) => symbol,
            SeriesKey::OptionContract { contract, .. } => contract,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeriesKey::Equity(symbol) => write!(f, "{symbol}"),
            SeriesKey::OptionContract {
                underlying,
                contract,
            } => write!(f, "{underlying}/{contract}"),
        }
    }
}

/// Calls or puts side of a chain snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionSide {
    Call,
    Put,
}

impl OptionSide {
    fn file_prefix(self) -> &'static str {
        match self {
            OptionSide::Call => "calls",
            OptionSide::Put => "puts",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn stocks_dir(&self) -> PathBuf {
        self.root.join("stocks")
    }

    fn options_dir(&self, underlying: &str) -> PathBuf {
        self.root.join("options").join(underlying)
    }

    pub fn series_path(&self, key: &SeriesKey) -> PathBuf {
        match key {
            SeriesKey::Equity(symbol) => self
                .stocks_dir()
                .join(format!("{symbol}{SERIES_EXTENSION}")),
            SeriesKey::OptionContract {
                underlying,
                contract,
            } => self
                .options_dir(underlying)
                .join("history")
                .join(format!("{contract}{SERIES_EXTENSION}")),
        }
    }

    pub fn summary_path(&self, underlying: &str, expiration: NaiveDate, side: OptionSide) -> PathBuf {
        self.options_dir(underlying).join("summary").join(format!(
            "{}-{}{SERIES_EXTENSION}",
            side.file_prefix(),
            expiration.format("%Y-%m-%d")
        ))
    }

    /// All stored series: equities first, then option contracts grouped by underlying.
    pub fn list_series(&self) -> io::Result<Vec<SeriesKey>> {
        let mut keys: Vec<SeriesKey> = series_stems(&self.stocks_dir())?
            .into_iter()
            .map(SeriesKey::Equity)
            .collect();

        let options_root = self.root.join("options");
        let mut underlyings = subdirectories(&options_root)?;
        underlyings.sort();
        for underlying in underlyings {
            let history = self.options_dir(&underlying).join("history");
            for contract in series_stems(&history)? {
                keys.push(SeriesKey::contract(underlying.clone(), contract));
            }
        }

        Ok(keys)
    }
}

/// Sorted file stems of `*.csv.xz` files in `dir`; empty if `dir` is missing.
fn series_stems(dir: &Path) -> io::Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut stems = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(stem) = name.strip_suffix(SERIES_EXTENSION) {
            stems.push(stem.to_string());
        }
    }
    stems.sort();
    Ok(stems)
}

fn subdirectories(dir: &Path) -> io::Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    Ok(names)
}
