//! `tracing` subscriber setup for the crawler binary.
//!
//! `RUST_LOG` wins over the configured level when set.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Compact,
    /// Multi-line output with source locations.
    Pretty,
    /// One JSON object per event.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s} (expected compact, pretty or json)")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogInitError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("logging already initialized: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Install the global subscriber.
pub fn init_logging(level: &str, format: LogFormat) -> Result<(), LogInitError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_target(false))
            .try_init()?,
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_thread_names(true))
            .try_init()?,
        LogFormat::Json => registry
            .with(fmt::layer().json().with_thread_names(true))
            .try_init()?,
    }

    tracing::debug!(?format, level, "logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_formats() {
        assert_eq!("json".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("Pretty".parse::<LogFormat>(), Ok(LogFormat::Pretty));
        assert_eq!("compact".parse::<LogFormat>(), Ok(LogFormat::Compact));
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
