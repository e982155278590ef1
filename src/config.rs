use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::SlotPolicy;
use crate::model::{format_time, parse_time};

/// Server settings, read once at startup from `GLOWBOOK_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub policy: SlotPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidTime { var: &'static str, value: String },
    InvalidSlotMinutes(String),
    InvalidPolicy(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidTime { var, value } => {
                write!(f, "{var}: expected HH:mm, got {value:?}")
            }
            ConfigError::InvalidSlotMinutes(value) => {
                write!(f, "GLOWBOOK_SLOT_MINUTES: expected a positive integer, got {value:?}")
            }
            ConfigError::InvalidPolicy(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparsable numbers fall back to their
    /// defaults; business hours must parse.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = SlotPolicy::default();
        let opens_at = time_var(&get, "GLOWBOOK_OPENS_AT", defaults.opens_at)?;
        let closes_at = time_var(&get, "GLOWBOOK_CLOSES_AT", defaults.closes_at)?;
        let granularity = match get("GLOWBOOK_SLOT_MINUTES") {
            None => defaults.granularity_minutes,
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|m| *m > 0)
                .ok_or(ConfigError::InvalidSlotMinutes(raw))?,
        };
        let policy =
            SlotPolicy::new(opens_at, closes_at, granularity).map_err(ConfigError::InvalidPolicy)?;

        Ok(Self {
            port: number_or(&get, "GLOWBOOK_PORT", 5433),
            bind: get("GLOWBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(get("GLOWBOOK_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("GLOWBOOK_PASSWORD").unwrap_or_else(|| "glowbook".into()),
            max_connections: number_or(&get, "GLOWBOOK_MAX_CONNECTIONS", 256),
            compact_threshold: number_or(&get, "GLOWBOOK_COMPACT_THRESHOLD", 1000),
            metrics_port: get("GLOWBOOK_METRICS_PORT").and_then(|s| s.parse().ok()),
            tls_cert: get("GLOWBOOK_TLS_CERT"),
            tls_key: get("GLOWBOOK_TLS_KEY"),
            policy,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn business_hours(&self) -> String {
        format!(
            "{}-{} every {} min",
            format_time(self.policy.opens_at),
            format_time(self.policy.closes_at),
            self.policy.granularity_minutes
        )
    }
}

fn number_or<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    get(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn time_var(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: chrono::NaiveTime,
) -> Result<chrono::NaiveTime, ConfigError> {
    match get(var) {
        None => Ok(default),
        Some(value) => parse_time(value.trim()).ok_or(ConfigError::InvalidTime { var, value }),
    }
}
