// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay server configuration.
//!
//! Defaults can be overridden by an optional JSON config file and, on top
//! of that, by environment variables (`MAX_SESSIONS`, `SESSION_TIMEOUT`,
//! ...). The configuration is immutable after startup.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Relay server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Human-readable project name, reported in logs
    #[serde(default = "default_project_name")]
    pub project_name: String,

    /// Address to bind to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// HTTP/WebSocket port to listen on (default: 8000)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum number of live sessions in the registry
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Advisory per-transfer size cap surfaced to clients (bytes)
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Idle age after which a session is evicted (seconds)
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// Heartbeat ping interval in seconds (0 disables the heartbeat task)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Advisory chunk size surfaced to clients (bytes)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Maximum chat message length (characters, not bytes)
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,

    /// Maximum concurrent connections per user id
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,

    /// How long a sender waits for its receiver before giving up (seconds)
    #[serde(default = "default_receiver_wait")]
    pub receiver_wait_secs: u64,

    /// Idle-session sweep cadence (seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_project_name() -> String {
    "File Transfer Relay".to_string()
}

fn default_bind_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8000
}

fn default_max_sessions() -> usize {
    200
}

fn default_max_file_size() -> u64 {
    5 * 1024 * 1024 * 1024 // 5 GiB
}

fn default_session_timeout() -> u64 {
    30 * 60 // 30 minutes
}

fn default_ping_interval() -> u64 {
    30
}

fn default_chunk_size() -> usize {
    128 * 1024
}

fn default_max_message_length() -> usize {
    5000
}

fn default_max_connections_per_user() -> usize {
    5
}

fn default_receiver_wait() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            bind_address: default_bind_address(),
            port: default_port(),
            max_sessions: default_max_sessions(),
            max_file_size: default_max_file_size(),
            session_timeout_secs: default_session_timeout(),
            ping_interval_secs: default_ping_interval(),
            chunk_size: default_chunk_size(),
            max_message_length: default_max_message_length(),
            max_connections_per_user: default_max_connections_per_user(),
            receiver_wait_secs: default_receiver_wait(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Overlay environment variables on top of this configuration.
    ///
    /// `SESSION_TIMEOUT` is given in minutes to match the deployment
    /// contract; everything else is taken at face value.
    pub fn apply_env(&mut self) {
        if let Ok(name) = std::env::var("PROJECT_NAME") {
            self.project_name = name;
        }
        env_parse("PORT", &mut self.port);
        env_parse("MAX_SESSIONS", &mut self.max_sessions);
        env_parse("MAX_FILE_SIZE", &mut self.max_file_size);
        env_parse("PING_INTERVAL", &mut self.ping_interval_secs);
        env_parse("CHUNK_SIZE", &mut self.chunk_size);
        env_parse("MAX_MESSAGE_LENGTH", &mut self.max_message_length);
        env_parse("MAX_CONNECTIONS_PER_USER", &mut self.max_connections_per_user);

        // Minutes on the wire; an absent variable leaves a file-provided
        // seconds value untouched.
        if let Ok(raw) = std::env::var("SESSION_TIMEOUT") {
            match raw.parse::<u64>() {
                Ok(mins) => self.session_timeout_secs = mins * 60,
                Err(_) => warn!("Ignoring unparsable SESSION_TIMEOUT={:?}", raw),
            }
        }
    }

    /// Get the session idle timeout as a Duration.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Get the heartbeat interval as a Duration (`None` when disabled).
    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }

    /// Get the sender rendezvous ceiling as a Duration.
    pub fn receiver_wait(&self) -> Duration {
        Duration::from_secs(self.receiver_wait_secs)
    }

    /// Get the sweep cadence as a Duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue("port cannot be 0".into()));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::InvalidValue("max_sessions cannot be 0".into()));
        }
        if self.max_connections_per_user == 0 {
            return Err(ConfigError::InvalidValue(
                "max_connections_per_user cannot be 0".into(),
            ));
        }
        if self.max_message_length == 0 {
            return Err(ConfigError::InvalidValue(
                "max_message_length cannot be 0".into(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "sweep_interval_secs cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

/// Parse an environment variable into `slot`, keeping the current value on
/// absence or parse failure.
fn env_parse<T: FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => warn!("Ignoring unparsable {}={:?}", key, raw),
        }
    }
}

/// Configuration error types.
#[derive(Debug, Clone)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoError(s) => write!(f, "I/O error: {}", s),
            Self::ParseError(s) => write!(f, "Parse error: {}", s),
            Self::InvalidValue(s) => write!(f, "Invalid value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
