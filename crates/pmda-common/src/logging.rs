//! Logging configuration and initialization.
//!
//! Centralized tracing setup for all pmda-load components. Supports text or
//! JSON output and level configuration from the config file or the
//! `PMDA_LOG_LEVEL` environment variable.

use anyhow::Result;
use serde::Deserialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// Structured JSON output, one event per line
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// `PMDA_LOG_LEVEL` overrides the configured level when set. Safe to call
/// once per process; a second call returns an error from the subscriber
/// registry rather than panicking.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let level = std::env::var("PMDA_LOG_LEVEL").unwrap_or_else(|_| config.level.clone());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Text => {
            registry
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .try_init()?;
        }
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_target(false))
                .try_init()?;
        }
    }

    Ok(())
}
