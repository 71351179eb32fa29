use std::fs;
use std::io;
use std::path::Path;

use log::LevelFilter;
use thiserror::Error;

use crate::os::cancel::StrategyChoice;

/// Runtime configuration of a descriptor table (simple key=value format).
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// Number of descriptor entries.
    pub table_capacity: usize,
    /// Upper bound on slots per descriptor.
    pub max_slots: usize,
    pub cancel_strategy: StrategyChoice,
    /// How long `free` waits for cancelled slots to finish; negative waits forever.
    pub drain_timeout_ms: isize,
    pub log_level: LevelFilter,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            table_capacity: 256,
            max_slots: 64,
            cancel_strategy: StrategyChoice::Auto,
            drain_timeout_ms: 1000,
            log_level: LevelFilter::Warn,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O: {0}")]
    Io(#[from] io::Error),
    #[error("invalid line: {0}")]
    InvalidFormat(String),
    #[error("unknown key: {0}")]
    UnknownKey(String),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

impl PollConfig {
    /// Load configuration from a simple key=value file.
    /// Example:
    /// table_capacity=64
    /// max_slots=8
    /// cancel_strategy=thread
    /// drain_timeout_ms=500
    /// log_level=debug
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse key=value text; keys that are absent keep their defaults.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut cfg = PollConfig::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else {
                return Err(ConfigError::InvalidFormat(line.to_string()));
            };
            let val = val.trim().trim_matches(|c| c == '"' || c == '\'');

            match key.trim() {
                "table_capacity" => cfg.table_capacity = parse_positive("table_capacity", val)?,
                "max_slots" => cfg.max_slots = parse_positive("max_slots", val)?,
                "cancel_strategy" => {
                    cfg.cancel_strategy = val.parse().map_err(|_| invalid("cancel_strategy", val))?
                }
                "drain_timeout_ms" => {
                    cfg.drain_timeout_ms = val.parse().map_err(|_| invalid("drain_timeout_ms", val))?
                }
                "log_level" => cfg.log_level = val.parse().map_err(|_| invalid("log_level", val))?,
                other => return Err(ConfigError::UnknownKey(other.to_string())),
            }
        }
        Ok(cfg)
    }
}

fn invalid(key: &'static str, value: &str) -> ConfigError {
    ConfigError::InvalidValue { key, value: value.to_string() }
}

fn parse_positive(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(invalid(key, value)),
    }
}
