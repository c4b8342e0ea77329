//! Frame and record types for the agent RPC channel
//!
//! Both transports carry the same JSON frames: the socket transport as
//! newline-delimited lines, the broker transport as message payloads on the
//! configured topic pair. The envelope is internal to the transports; callers
//! only ever see [`AgentEvent`] and [`AgentLogEntry`] records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Local lifecycle topic fired after a successful connect
pub const AGENT_CONNECTED_TOPIC: &str = "fx/console/agent/connected";

/// Local lifecycle topic fired when the peer is lost (socket EOF, broker
/// disconnect, or a last-will message)
pub const AGENT_DISCONNECTED_TOPIC: &str = "fx/console/agent/disconnected";

/// One frame on the RPC channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// Console-to-agent invocation
    Request {
        id: Uuid,
        method: String,
        #[serde(default)]
        params: Value,
    },
    /// Agent-to-console completion of a prior request
    Response {
        id: Uuid,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    /// Framework event observed on the agent side
    Event { event: AgentEvent },
    /// Log record forwarded from the agent's log reader
    Log { entry: AgentLogEntry },
    /// Redirected console output from the agent's shell
    Stdout { text: String },
    Stderr { text: String },
}

/// Framework event record delivered to topic-matched listeners
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentEvent {
    pub topic: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    pub received_at: DateTime<Utc>,
}

impl AgentEvent {
    /// Event on a local lifecycle topic, carrying no properties
    pub fn lifecycle(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            properties: HashMap::new(),
            received_at: Utc::now(),
        }
    }
}

/// Severity of a remote log record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Log record delivered to every registered log listener
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentLogEntry {
    pub level: LogLevel,
    pub message: String,
    pub logger: Option<String>,
    pub logged_at: DateTime<Utc>,
    /// Rendered stack trace when the record carries a failure
    pub exception: Option<String>,
}
