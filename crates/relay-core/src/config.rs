//! Configuration for the relay
//!
//! Loaded from an optional TOML file layered with `FILEROCKET__`-prefixed
//! environment variables (`FILEROCKET__SESSION__IDLE_TIMEOUT_SECS=600`).
//! Every section has defaults, so an empty configuration is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::code::DEFAULT_ALPHABET;
use crate::errors::{RelayError, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerSettings,
    pub session: SessionSettings,
    pub relay: RelaySettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_address: String,
    /// Largest signaling frame accepted from a client
    pub max_message_bytes: usize,
}

/// Session lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub code_length: usize,
    pub code_alphabet: String,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_code_attempts: usize,
    /// Bound of each session task's event queue
    pub event_queue_capacity: usize,
}

/// Chunk relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Broadcast progress every Nth chunk (and always on the last one)
    pub progress_interval: u64,
    pub sink_mode: SinkMode,
    /// Chunks the streaming sink buffers before deferring acknowledgements
    pub sink_buffer_chunks: usize,
}

/// Download sink strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkMode {
    /// Push chunks through to the open download response
    #[default]
    Streaming,
    /// Accumulate the whole file, then serve it
    Buffering,
}

/// Session registry backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageSettings {
    #[default]
    Memory,
    File { path: PathBuf },
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Source file and line on every event
    pub file_info: bool,
    /// Log HTTP request spans when they close, with timings
    pub span_timings: bool,
    /// Extra filter directives such as `tower_http=debug`
    pub directives: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            max_message_bytes: 64 * 1024 * 1024,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            code_length: 6,
            code_alphabet: DEFAULT_ALPHABET.to_string(),
            idle_timeout_secs: 30 * 60,
            sweep_interval_secs: 5 * 60,
            max_code_attempts: 64,
            event_queue_capacity: 256,
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            progress_interval: 10,
            sink_mode: SinkMode::Streaming,
            sink_buffer_chunks: 4,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_info: false,
            span_timings: false,
            directives: Vec::new(),
        }
    }
}

impl SessionSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl RelayConfig {
    /// Load configuration from an optional file plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: RelayConfig = builder
            .add_source(
                config::Environment::with_prefix("FILEROCKET")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the relay cannot run with
    pub fn validate(&self) -> Result<()> {
        let session = &self.session;
        if session.code_length == 0 {
            return Err(RelayError::config("session.code_length must be at least 1"));
        }
        if session.code_alphabet.is_empty() || !session.code_alphabet.is_ascii() {
            return Err(RelayError::config(
                "session.code_alphabet must be a non-empty ASCII string",
            ));
        }
        if session.max_code_attempts == 0 || session.event_queue_capacity == 0 {
            return Err(RelayError::config(
                "session.max_code_attempts and session.event_queue_capacity must be positive",
            ));
        }
        if session.sweep_interval_secs == 0 {
            return Err(RelayError::config("session.sweep_interval_secs must be positive"));
        }
        if self.relay.progress_interval == 0 || self.relay.sink_buffer_chunks == 0 {
            return Err(RelayError::config(
                "relay.progress_interval and relay.sink_buffer_chunks must be positive",
            ));
        }
        Ok(())
    }
}
