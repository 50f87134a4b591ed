//! Tracing subscriber setup
//!
//! `RUST_LOG` takes precedence over the configured level. Console output
//! goes to stderr so command output on stdout stays machine-readable; the
//! optional log file always receives JSON lines.

use crate::config::LoggingConfig;
use crate::error::{IndexError, IndexResult};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    pub fn parse(name: &str) -> IndexResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(IndexError::Configuration(format!(
                "unknown log format {:?} (expected pretty or json)",
                other
            ))),
        }
    }
}

/// Install the global tracing subscriber
pub fn init(config: &LoggingConfig) -> IndexResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| {
            IndexError::Configuration(format!("invalid log level {:?}: {}", config.level, e))
        })?;

    let console = match LogFormat::parse(&config.format)? {
        LogFormat::Pretty => fmt::layer().with_writer(std::io::stderr).boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    };

    let file = match &config.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| IndexError::Configuration(format!("logging already initialized: {}", e)))
}
