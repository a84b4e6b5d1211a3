//! Logging initialization.
//!
//! Structured logging through the `tracing` crate. The subscriber writes
//! to stdout in text or JSON with UTC timestamps; the `PURSER_LOG`
//! environment variable, when set, overrides the configured level filter
//! entirely.

use crate::error::InventoryError;
use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error, off
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: json, text
    #[serde(default = "default_format")]
    pub format: String,

    /// Colored output (text format only)
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "text".to_string()
}

fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_format(),
            color: default_color(),
        }
    }
}

impl LoggingConfig {
    /// Section validation used by the config loader.
    pub fn validate(&self) -> Result<(), String> {
        const LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];
        if !LEVELS.contains(&self.level.as_str()) {
            return Err(format!("unknown log level '{}'", self.level));
        }
        if self.format != "text" && self.format != "json" {
            return Err(format!(
                "unknown log format '{}' (expected 'text' or 'json')",
                self.format
            ));
        }
        Ok(())
    }
}

/// Initialize the global tracing subscriber.
///
/// Safe to call more than once: a second initialization keeps the first
/// subscriber. Level priority is `PURSER_LOG`, then the configured level,
/// then `info`.
pub fn init_logging(config: Option<&LoggingConfig>) -> Result<(), InventoryError> {
    let filter = build_env_filter(config);

    let format = config.map(|c| c.format.as_str()).unwrap_or("text");
    if format != "json" && format != "text" {
        return Err(InventoryError::Config(format!(
            "invalid log format '{}' (must be 'json' or 'text')",
            format
        )));
    }
    let use_color = config.map(|c| c.color).unwrap_or(true);

    let base_subscriber = Registry::default().with(filter);
    let initialized = if format == "json" {
        base_subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(std::io::stdout),
            )
            .try_init()
    } else {
        base_subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(use_color)
                    .with_writer(std::io::stdout),
            )
            .try_init()
    };
    // Err here means a subscriber is already installed; keep it.
    drop(initialized);

    Ok(())
}

/// Build the level filter from `PURSER_LOG` or the config.
fn build_env_filter(config: Option<&LoggingConfig>) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_env("PURSER_LOG") {
        return filter;
    }
    let level = config.map(|c| c.level.as_str()).unwrap_or("info");
    EnvFilter::new(level)
}
