//! Error taxonomy for the connection supervisor
//!
//! Connect-time failures are synchronous `Result`s surfaced to the caller;
//! post-connect peer loss is reported as a dispatched lifecycle event, never
//! as an error from this module.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for supervisor operations
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    #[error("Connect failed: {message}")]
    Connect { message: String },

    #[error("Connect timed out after {timeout_ms} ms")]
    ConnectTimeout { timeout_ms: u64 },

    #[error("Token acquisition failed: {message}")]
    TokenAcquisition { message: String },

    #[error("Agent is not connected")]
    NotConnected,

    #[error("A session is already open; disconnect it first")]
    AlreadyConnected,

    #[error("RPC call failed: {message}")]
    Rpc { message: String },

    #[error("Transport error")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Serialization error")]
    Serialization(#[from] serde_json::Error),
}

impl SupervisorError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connect error
    pub fn connect<S: Into<String>>(message: S) -> Self {
        Self::Connect {
            message: message.into(),
        }
    }

    /// Create a token acquisition error; token endpoint failures can echo
    /// request parameters, so the message is always sanitized
    pub fn token_acquisition<S: Into<String>>(message: S) -> Self {
        Self::TokenAcquisition {
            message: sanitize_error_message(&message.into()),
        }
    }

    /// Create an RPC error
    pub fn rpc<S: Into<String>>(message: S) -> Self {
        Self::Rpc {
            message: message.into(),
        }
    }

    /// True for errors worth retrying at the connect level
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, Self::Connect { message } if message.contains("refused"))
    }
}

static SECRET_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").unwrap());

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").unwrap()
});

const MAX_MESSAGE_LEN: usize = 500;

/// Redact credential-looking fragments and sensitive paths from error text
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN.replace_all(message, "${1}=***").to_string();
    sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let max_content_len = MAX_MESSAGE_LEN - truncate_suffix.len();
        sanitized = format!("{}{}", &sanitized[..max_content_len], truncate_suffix);
    }

    sanitized
}

/// Result type for supervisor operations
pub type SupervisorResult<T> = Result<T, SupervisorError>;
