// Runtime configuration.
// Values come from GYROLINK_* environment variables; anything unset falls back to the defaults below.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SIGNAL_URL: &str = "ws://127.0.0.1:8787";
pub const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:8787";
pub const DEFAULT_PAIRING_BASE: &str = "http://127.0.0.1:8787/pair";
pub const DEFAULT_CALIBRATION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SAMPLE_RATE_HZ: u32 = 60;

/// Default `tracing` level for the crate: verbose in debug builds, quiet in release
#[cfg(debug_assertions)]
pub fn default_log_level() -> &'static str {
    "debug"
}

#[cfg(not(debug_assertions))]
pub fn default_log_level() -> &'static str {
    "info"
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be a positive number, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },
    #[error("GYROLINK_ICE_SERVERS is not a valid server list: {0}")]
    InvalidIceServers(#[from] serde_json::Error),
    #[error("ICE server {id:?}: {reason}")]
    IceServer { id: String, reason: &'static str },
}

/// ICE server entry
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::IceServer {
                id: self.id.clone(),
                reason: "url cannot be empty",
            });
        }
        if self.r#type == "turn" && (self.username.is_none() || self.credential.is_none()) {
            return Err(ConfigError::IceServer {
                id: self.id.clone(),
                reason: "TURN servers require username and credential",
            });
        }
        Ok(())
    }
}

pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Relay endpoint the viewer and source connect to
    pub signal_url: String,
    /// Address the relay binds when running `gyrolink relay`
    pub relay_addr: String,
    /// Base of the pairing link shown to the sensor source
    pub pairing_base: String,
    pub ice_servers: Vec<ServerConfig>,
    pub calibration_timeout: Duration,
    pub sample_rate_hz: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signal_url: DEFAULT_SIGNAL_URL.into(),
            relay_addr: DEFAULT_RELAY_ADDR.into(),
            pairing_base: DEFAULT_PAIRING_BASE.into(),
            ice_servers: default_ice_servers(),
            calibration_timeout: DEFAULT_CALIBRATION_TIMEOUT,
            sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let ice_servers = match lookup("GYROLINK_ICE_SERVERS") {
            Some(raw) => {
                let servers: Vec<ServerConfig> = serde_json::from_str(&raw)?;
                for server in &servers {
                    server.validate()?;
                }
                servers
            }
            None => defaults.ice_servers,
        };

        let calibration_timeout = match lookup("GYROLINK_CALIBRATION_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(parse_positive("GYROLINK_CALIBRATION_TIMEOUT_SECS", raw)?),
            None => defaults.calibration_timeout,
        };

        let sample_rate_hz = match lookup("GYROLINK_SAMPLE_HZ") {
            Some(raw) => parse_positive("GYROLINK_SAMPLE_HZ", raw)? as u32,
            None => defaults.sample_rate_hz,
        };

        Ok(Self {
            signal_url: lookup("GYROLINK_SIGNAL_URL").unwrap_or(defaults.signal_url),
            relay_addr: lookup("GYROLINK_RELAY_ADDR").unwrap_or(defaults.relay_addr),
            pairing_base: lookup("GYROLINK_PAIRING_BASE").unwrap_or(defaults.pairing_base),
            ice_servers,
            calibration_timeout,
            sample_rate_hz,
        })
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.sample_rate_hz.max(1) as f64)
    }
}

fn parse_positive(key: &'static str, value: String) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 && n <= u32::MAX as u64 => Ok(n),
        _ => Err(ConfigError::InvalidNumber { key, value }),
    }
}
