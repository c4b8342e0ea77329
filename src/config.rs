//! Connection parameters and console configuration
//!
//! The UI/CLI layer supplies connection parameters as plain data records;
//! the supervisor has no knowledge of how they were collected. The CLI reads
//! them from a TOML profile via [`ConsoleConfig::load_from_file`].

use crate::auth::TokenConfig;
use crate::error::{SupervisorError, SupervisorResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Retry forever on connection-refused
pub const TIMEOUT_UNBOUNDED: i64 = -1;

/// Parameters for the raw socket (TCP/TLS) transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SocketParams {
    /// Agent host name or address
    pub host: String,
    /// Agent port
    pub port: u16,
    /// Connect timeout budget in milliseconds; -1 retries forever,
    /// 0 means a single attempt
    #[serde(default)]
    pub timeout: i64,
    /// Wrap the connection in TLS; implied by a configured trust store
    #[serde(default)]
    pub tls: bool,
    /// PEM bundle of trusted CA certificates; TLS against the webpki root
    /// set when `tls` is requested without one
    pub trust_store: Option<PathBuf>,
    /// Password for the trust store (unused for PEM bundles, kept for
    /// profile compatibility)
    pub trust_store_password: Option<String>,
}

impl SocketParams {
    pub fn new(host: impl Into<String>, port: u16, timeout: i64) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
            tls: false,
            trust_store: None,
            trust_store_password: None,
        }
    }

    pub fn validate(&self) -> SupervisorResult<()> {
        if self.host.is_empty() {
            return Err(SupervisorError::configuration("host cannot be empty"));
        }
        if self.timeout < TIMEOUT_UNBOUNDED {
            return Err(SupervisorError::configuration(
                "timeout cannot be less than -1",
            ));
        }
        if self.trust_store.is_none() && self.trust_store_password.is_some() {
            return Err(SupervisorError::configuration(
                "trust store password given without a trust store",
            ));
        }
        Ok(())
    }
}

/// Parameters for the MQTT broker transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerParams {
    /// Broker host name or address
    pub server: String,
    /// Broker port
    pub port: u16,
    /// MQTT client identifier
    pub client_id: String,
    /// Username for simple auth; auth is skipped entirely when absent
    pub username: Option<String>,
    /// Plain password; takes precedence over `token`
    pub password: Option<String>,
    /// OAuth2 client-credentials configuration used when no plain
    /// password is supplied
    pub token: Option<TokenConfig>,
    /// Topic on which commands to the agent are published
    pub pub_topic: String,
    /// Topic on which responses and events from the agent arrive
    pub sub_topic: String,
    /// Last-will topic announcing an ungraceful agent disconnect
    pub lwt_topic: Option<String>,
    /// Overall connect timeout in milliseconds
    #[serde(default = "default_broker_timeout")]
    pub timeout: u64,
}

fn default_broker_timeout() -> u64 {
    10_000
}

impl BrokerParams {
    pub fn validate(&self) -> SupervisorResult<()> {
        if self.server.is_empty() {
            return Err(SupervisorError::configuration("server cannot be empty"));
        }
        if self.client_id.is_empty() {
            return Err(SupervisorError::configuration("client id cannot be empty"));
        }
        if self.pub_topic.is_empty() || self.sub_topic.is_empty() {
            return Err(SupervisorError::configuration(
                "pub and sub topics cannot be empty",
            ));
        }
        if self.pub_topic == self.sub_topic {
            return Err(SupervisorError::configuration(
                "pub and sub topics must differ",
            ));
        }
        Ok(())
    }
}

/// The two interchangeable ways of reaching an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionParams {
    Socket(SocketParams),
    Broker(BrokerParams),
}

impl ConnectionParams {
    pub fn validate(&self) -> SupervisorResult<()> {
        match self {
            ConnectionParams::Socket(params) => params.validate(),
            ConnectionParams::Broker(params) => params.validate(),
        }
    }
}

/// Retry strategy for socket connects, selected by configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RetryConfig {
    /// Decrement the timeout budget by a fixed step between attempts
    Linear {
        #[serde(default = "default_linear_step")]
        step_ms: u64,
    },
    /// Exponential backoff starting at the configured timeout
    Exponential {
        #[serde(default = "default_backoff_multiplier")]
        multiplier: f64,
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
    },
}

fn default_linear_step() -> u64 {
    200
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

fn default_max_attempts() -> u32 {
    4
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig::Linear {
            step_ms: default_linear_step(),
        }
    }
}

/// Console-side connection profile loaded by the CLI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsoleConfig {
    /// Remote shell channel: negative attaches to an existing local
    /// command session, 0 the standard console, positive a stream port
    pub shell: Option<i32>,
    pub connection: ConnectionParams,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConsoleConfig {
    /// Load a connection profile from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ConsoleConfig = toml::from_str(&content)?;
        config
            .connection
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(config)
    }
}
