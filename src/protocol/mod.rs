//! Wire frames and event records exchanged with the remote agent

pub mod messages;
pub mod topics;

pub use messages::{
    AgentEvent, AgentLogEntry, Frame, LogLevel, AGENT_CONNECTED_TOPIC, AGENT_DISCONNECTED_TOPIC,
};
pub use topics::matches_topic;
