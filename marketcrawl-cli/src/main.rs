//! marketcrawl CLI: crawl, status and verify commands.
//!
//! Commands:
//! - `crawl`: bring every configured equity and its in-the-money option
//!   contracts up to date
//! - `status`: list stored series with watermark and size
//! - `verify`: scan every series file for ordering violations

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use marketcrawl_core::data::{
    CircuitBreaker, CrawlOptions, Crawler, DataLayout, HttpCache, LogProgress, SeriesKey,
    SeriesStore, SymbolError, YahooProvider,
};
use marketcrawl_core::logging::{init_logging, LogFormat};
use marketcrawl_core::CrawlConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "marketcrawl",
    about = "Daily OHLCV and option chain crawler with an append-only xz CSV store"
)]
struct Cli {
    /// Log filter (e.g. info, debug, marketcrawl_core=trace). RUST_LOG overrides it.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log output: compact, pretty or json.
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch new daily bars for every configured symbol.
    Crawl {
        /// Path to the JSON config file.
        #[arg(long, default_value = "config.json")]
        config: PathBuf,

        /// Data directory. Overrides `data_dir` from the config.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Option contract workers. Overrides `workers` from the config.
        #[arg(long)]
        workers: Option<usize>,

        /// Skip option chains and contract histories.
        #[arg(long, default_value_t = false)]
        skip_options: bool,

        /// Disable the HTTP response cache.
        #[arg(long, default_value_t = false)]
        no_cache: bool,
    },
    /// List stored series with watermark and size.
    Status {
        /// Data directory. Defaults to ./data.
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },
    /// Check every series file is strictly ascending by date.
    Verify {
        /// Data directory. Defaults to ./data.
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format).context("failed to initialize logging")?;

    match cli.command {
        Commands::Crawl {
            config,
            data_dir,
            workers,
            skip_options,
            no_cache,
        } => run_crawl(&config, data_dir, workers, skip_options, no_cache),
        Commands::Status { data_dir } => run_status(&data_dir),
        Commands::Verify { data_dir } => run_verify(&data_dir),
    }
}

fn run_crawl(
    config_path: &Path,
    data_dir: Option<PathBuf>,
    workers: Option<usize>,
    skip_options: bool,
    no_cache: bool,
) -> Result<()> {
    let mut config = CrawlConfig::from_file(config_path)
        .with_context(|| format!("failed to load config {}", config_path.display()))?;
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    if workers.is_some() {
        config.workers = workers;
    }
    if skip_options {
        config.options = false;
    }
    if no_cache {
        config.http_cache.enabled = false;
    }
    config.validate()?;

    let cache = if config.http_cache.enabled {
        let cache = HttpCache::open(&config.http_cache.dir, config.cache_ttl()).with_context(|| {
            format!(
                "failed to open HTTP cache {}",
                config.http_cache.dir.display()
            )
        })?;
        Some(Arc::new(cache))
    } else {
        None
    };

    let circuit_breaker = Arc::new(CircuitBreaker::default_provider());
    let provider = YahooProvider::new(config.provider.to_yahoo(), circuit_breaker, cache)
        .context("failed to build Yahoo client")?;
    let store = SeriesStore::new(DataLayout::new(&config.data_dir));

    let options = CrawlOptions {
        today: chrono::Utc::now().date_naive(),
        include_options: config.options,
        workers: config.effective_workers(),
    };
    tracing::info!(
        symbols = config.symbols.len(),
        data_dir = %config.data_dir.display(),
        workers = options.workers,
        options = options.include_options,
        today = %options.today,
        "starting crawl"
    );

    let crawler = Crawler::new(&provider, &store, options).context("failed to start worker pool")?;
    let summary = crawler.run(&config.symbols, &LogProgress);

    println!();
    println!("=== Crawl Summary ===");
    println!("Series:         {}", summary.reports.len());
    println!("Created:        {}", summary.created());
    println!("Appended:       {}", summary.appended());
    println!("Up to date:     {}", summary.up_to_date());
    println!("No data:        {}", summary.no_data());
    println!("Failed:         {}", summary.failed() - summary.no_data());
    println!("Rows written:   {}", summary.rows_written());

    for report in &summary.reports {
        if let Err(err) = &report.result {
            if !err.is_no_data() {
                eprintln!("Error for {}: {}", report.key, describe(err));
            }
        }
    }
    for failure in &summary.options_failures {
        match failure.expiration {
            Some(exp) => eprintln!(
                "Options error for {} ({exp}): {}",
                failure.underlying, failure.error
            ),
            None => eprintln!("Options error for {}: {}", failure.underlying, failure.error),
        }
    }

    // Per-series failures are reported, not fatal.
    Ok(())
}

fn describe(err: &SymbolError) -> String {
    match err {
        SymbolError::DuplicateContract { .. } | SymbolError::InvalidContract { .. } => {
            format!("data integrity: {err}")
        }
        _ => err.to_string(),
    }
}

fn run_status(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        println!("Data directory does not exist: {}", data_dir.display());
        return Ok(());
    }

    let store = SeriesStore::new(DataLayout::new(data_dir));
    let keys = store
        .layout()
        .list_series()
        .with_context(|| format!("failed to list series under {}", data_dir.display()))?;

    if keys.is_empty() {
        println!("No series stored in {}", data_dir.display());
        return Ok(());
    }

    let mut total_size = 0u64;
    let mut rows = Vec::with_capacity(keys.len());
    for key in &keys {
        let watermark = match store.read_watermark(key) {
            Ok(Some(date)) => date.to_string(),
            Ok(None) => "(empty)".into(),
            Err(err) => {
                tracing::warn!(series = %key, error = %err, "unreadable series");
                "(unreadable)".into()
            }
        };
        let size = std::fs::metadata(store.path(key)).map(|m| m.len()).unwrap_or(0);
        total_size += size;
        rows.push((key.to_string(), kind(key), watermark, size));
    }

    println!("Data: {}", data_dir.display());
    println!("Series: {}", rows.len());
    println!("Total size: {}", format_size(total_size));
    println!();
    println!("{:<32} {:<8} {:<12} {:>10}", "Series", "Kind", "Watermark", "Size");
    println!("{}", "-".repeat(65));
    for (series, kind, watermark, size) in &rows {
        println!(
            "{:<32} {:<8} {:<12} {:>10}",
            series,
            kind,
            watermark,
            format_size(*size)
        );
    }

    Ok(())
}

fn run_verify(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        bail!("data directory does not exist: {}", data_dir.display());
    }

    let store = SeriesStore::new(DataLayout::new(data_dir));
    let keys = store
        .layout()
        .list_series()
        .with_context(|| format!("failed to list series under {}", data_dir.display()))?;

    let mut bad = 0usize;
    for key in &keys {
        match store.verify(key) {
            Ok(report) if report.is_ordered() => {
                tracing::debug!(series = %key, rows = report.rows, "ok");
            }
            Ok(report) => {
                bad += 1;
                for (row, date) in &report.violations {
                    eprintln!("{key}: row {row} dated {date} is not after the previous row");
                }
            }
            Err(err) => {
                bad += 1;
                eprintln!("{key}: {err}");
            }
        }
    }

    println!("Verified {} series, {bad} with problems.", keys.len());
    if bad > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn kind(key: &SeriesKey) -> &'static str {
    match key {
        SeriesKey::Equity(_) => "equity",
        SeriesKey::OptionContract { .. } => "option",
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_crawl_overrides() {
        let cli = Cli::try_parse_from([
            "marketcrawl",
            "--log-format",
            "json",
            "crawl",
            "--config",
            "my.json",
            "--workers",
            "3",
            "--skip-options",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Commands::Crawl {
                config,
                workers,
                skip_options,
                no_cache,
                ..
            } => {
                assert_eq!(config, PathBuf::from("my.json"));
                assert_eq!(workers, Some(3));
                assert!(skip_options);
                assert!(!no_cache);
            }
            _ => panic!("expected crawl"),
        }
    }

    #[test]
    fn rejects_unknown_log_format() {
        assert!(Cli::try_parse_from(["marketcrawl", "--log-format", "xml", "status"]).is_err());
    }

    #[test]
    fn formats_sizes() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }
}
