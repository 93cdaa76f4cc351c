//! Tracing subscriber setup for the relay binary
//!
//! `RUST_LOG` wins when set; otherwise the configured level applies to the
//! relay crates and `warn` to everything else, so dependency chatter (hyper,
//! tower) stays out of session logs.

use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingSettings;
use crate::errors::{RelayError, Result};

const RELAY_TARGETS: [&str; 2] = ["filerocket_relay_core", "filerocket_server"];

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level for the relay crates
    pub level: Level,
    pub json: bool,
    /// Include source file and line
    pub file_info: bool,
    /// Emit span close events with their timings (HTTP requests)
    pub span_timings: bool,
    /// Extra `target=level` directives appended to the filter
    pub directives: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json: false,
            file_info: false,
            span_timings: false,
            directives: Vec::new(),
        }
    }
}

impl LoggingConfig {
    /// Build from the `[logging]` section of the relay configuration
    pub fn from_settings(settings: &LoggingSettings) -> Result<Self> {
        let mut config = Self {
            level: parse_log_level(&settings.level)?,
            json: settings.json,
            ..Default::default()
        };
        if settings.file_info {
            config = config.with_file_info();
        }
        if settings.span_timings {
            config = config.with_span_timings();
        }
        for directive in &settings.directives {
            config = config.with_directive(directive.as_str());
        }
        Ok(config)
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_span_timings(mut self) -> Self {
        self.span_timings = true;
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Filter string used when `RUST_LOG` is absent
    pub fn filter_directives(&self) -> String {
        let level = self.level.as_str().to_ascii_lowercase();
        let mut parts = vec!["warn".to_string()];
        parts.extend(RELAY_TARGETS.iter().map(|target| format!("{}={}", target, level)));
        parts.extend(self.directives.iter().cloned());
        parts.join(",")
    }
}

/// Install the global subscriber; fails if one is already set
pub fn setup_logging(config: LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.filter_directives())
            .map_err(|e| RelayError::config(format!("Invalid log filter: {}", e)))?,
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(if config.span_timings {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        })
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| RelayError::config(format!("Failed to install subscriber: {}", e)))
}

pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level.trim())
        .map_err(|_| RelayError::config(format!("Invalid log level: {}", level)))
}

/// First line of every run
pub fn log_startup(version: &str) {
    tracing::info!("filerocket relay v{} starting", version);
}
