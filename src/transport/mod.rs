//! Transport layer for the agent RPC channel
//!
//! One contract, two structurally different implementations: a raw
//! bidirectional socket and an MQTT publish/subscribe pair. The supervisor
//! only ever talks to the [`Transport`] trait; selecting an implementation
//! happens once, at connect time.

use crate::error::SupervisorResult;
use crate::rpc::AgentStub;

pub mod broker;
pub mod socket;

/// Which kind of channel the active transport runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Socket,
    Broker,
}

/// Connection lifecycle of a supervisor-owned transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Open,
    Closed,
}

/// Contract shared by both transports
///
/// Opening happens in each implementation's constructor; a value of a
/// transport type always started out open. The stub stays valid only while
/// `is_open` reports true.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// True while the channel to the peer is usable
    fn is_open(&self) -> bool;

    /// Handle to the remote agent's interface
    fn stub(&self) -> AgentStub;

    /// Tear the channel down; idempotent
    async fn close(&mut self) -> SupervisorResult<()>;
}

pub use broker::{BrokerTransport, Credentials};
pub use socket::{SocketTransport, TlsConfig};
