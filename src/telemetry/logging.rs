//! tracing subscriber setup
//!
//! The level comes from RUST_LOG when set, otherwise from the `[logging]`
//! section. Other crates are held at `warn` unless RUST_LOG says otherwise.

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// `[logging]` section
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Install the global subscriber. A second call leaves the first one in place.
pub fn init_logging(config: Option<&LogConfig>) {
    let filter = build_filter(config);
    let format = config.map(|c| c.format).unwrap_or_default();

    let installed = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().compact().with_target(false))
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init(),
    };

    if installed.is_err() {
        tracing::debug!("logging already initialized");
    }
}

fn build_filter(config: Option<&LogConfig>) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }

    let level = config
        .map(|cfg| level_or_info(&cfg.level))
        .unwrap_or(Level::INFO);
    EnvFilter::new(filter_directive(level))
}

fn filter_directive(level: Level) -> String {
    format!("warn,natkeeper={}", level.as_str().to_lowercase())
}

/// Unknown names fall back to `info`.
fn level_or_info(name: &str) -> Level {
    name.trim().parse().unwrap_or(Level::INFO)
}
