//! Process configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/rust_eudaq.toml`)
//! 2. environment variables prefixed with `RUST_EUDAQ_`, nested with `__`
//!
//! Every field has a default, so an absent file yields a usable configuration.
//!
//! # Example
//! ```no_run
//! use rust_eudaq::config::DaqConfig;
//!
//! let config = DaqConfig::load()?;
//! println!("RunControl listens on {}", config.run_control.listen);
//! # Ok::<(), rust_eudaq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::limits;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration shared by every role binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaqConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// RunControl server settings
    pub run_control: RunControlConfig,
    /// Settings for roles connecting to RunControl
    pub command_receiver: CommandReceiverConfig,
    /// DataCollector settings
    pub data_collector: DataCollectorConfig,
    /// LogCollector settings
    pub log_collector: LogCollectorConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "rust_eudaq".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// RunControl configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunControlConfig {
    /// Listen address for the CMD channel
    pub listen: String,
    /// Upper bound on one command round trip
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    /// STATUS polls while waiting for a state transition
    pub state_poll_attempts: u32,
    /// Interval between STATUS polls
    #[serde(with = "humantime_serde")]
    pub state_poll_interval: Duration,
    /// Wait between TERMINATE and closing the server
    #[serde(with = "humantime_serde")]
    pub terminate_grace: Duration,
}

impl Default for RunControlConfig {
    fn default() -> Self {
        Self {
            listen: "tcp://44000".to_string(),
            command_timeout: limits::COMMAND_TIMEOUT,
            state_poll_attempts: limits::STATE_POLL_ATTEMPTS,
            state_poll_interval: limits::STATE_POLL_INTERVAL,
            terminate_grace: limits::TERMINATE_GRACE,
        }
    }
}

/// Client-side settings for roles connecting to RunControl
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandReceiverConfig {
    /// Address of RunControl
    pub run_control: String,
    /// Connection attempts before giving up
    pub connect_retries: u32,
    /// Delay between connection attempts
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Wait for the server greeting
    #[serde(with = "humantime_serde")]
    pub greeting_timeout: Duration,
    /// Wait for the acknowledgement
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,
    /// Idle hook interval of the dispatch loop
    #[serde(with = "humantime_serde")]
    pub idle_interval: Duration,
}

impl Default for CommandReceiverConfig {
    fn default() -> Self {
        Self {
            run_control: "tcp://localhost:44000".to_string(),
            connect_retries: limits::CONNECT_RETRIES,
            retry_interval: limits::CONNECT_RETRY_INTERVAL,
            greeting_timeout: limits::GREETING_TIMEOUT,
            ack_timeout: limits::ACK_TIMEOUT,
            idle_interval: limits::IDLE_INTERVAL,
        }
    }
}

/// DataCollector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataCollectorConfig {
    /// Listen address for the DATA channel
    pub listen: String,
    /// Receiver FIFO capacity
    pub queue_capacity: usize,
    /// Bound on waiting for streams to finish on STOP
    #[serde(with = "humantime_serde")]
    pub stop_drain_timeout: Duration,
    /// Default sync algorithm (index, trigger, timestamp)
    pub sync_algorithm: String,
    /// Default file writer (null, memory)
    pub file_type: String,
}

impl Default for DataCollectorConfig {
    fn default() -> Self {
        Self {
            listen: "tcp://44001".to_string(),
            queue_capacity: limits::RECEIVER_QUEUE_CAPACITY,
            stop_drain_timeout: limits::STOP_DRAIN_TIMEOUT,
            sync_algorithm: "index".to_string(),
            file_type: "null".to_string(),
        }
    }
}

/// LogCollector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogCollectorConfig {
    /// Listen address for the LOG channel
    pub listen: String,
    /// File receiving every forwarded message, if set
    pub output: Option<PathBuf>,
}

impl Default for LogCollectorConfig {
    fn default() -> Self {
        Self {
            listen: "tcp://44002".to_string(),
            output: None,
        }
    }
}

impl DaqConfig {
    /// Load configuration from config/rust_eudaq.toml and environment variables
    ///
    /// Environment variables can override configuration with prefix RUST_EUDAQ_
    /// Example: RUST_EUDAQ_APPLICATION__LOG_LEVEL=debug
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/rust_eudaq.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUST_EUDAQ_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        for (what, address) in [
            ("run_control.listen", &self.run_control.listen),
            ("command_receiver.run_control", &self.command_receiver.run_control),
            ("data_collector.listen", &self.data_collector.listen),
            ("log_collector.listen", &self.log_collector.listen),
        ] {
            crate::transport::Address::parse(address)
                .map_err(|e| DaqError::Configuration(format!("{what}: {e}")))?;
        }

        if self.command_receiver.connect_retries == 0 {
            return Err(DaqError::Configuration(
                "command_receiver.connect_retries must be at least 1".to_string(),
            ));
        }

        if self.data_collector.queue_capacity == 0 {
            return Err(DaqError::Configuration(
                "data_collector.queue_capacity must be at least 1".to_string(),
            ));
        }

        crate::sync::policy_by_name(&self.data_collector.sync_algorithm, 0)?;

        Ok(())
    }
}
