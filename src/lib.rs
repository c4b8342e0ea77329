//! agentport - remote agent connection supervisor
//!
//! A management-console-side supervisor that establishes and maintains a
//! single logical RPC channel to a remote managed process ("agent") over one
//! of two interchangeable transports: a raw bidirectional socket (TCP,
//! optionally TLS) or an MQTT v5 publish/subscribe broker.
//!
//! # Overview
//!
//! - connect-with-retry for the socket path, configurable policy
//! - synchronous connect over the broker's asynchronous lifecycle, with a
//!   hard timeout
//! - OAuth2 client-credentials tokens with expiry-aware caching
//! - a single remote stub ([`rpc::AgentStub`]) live per session
//! - topic-matched event fan-out and unconditional log fan-out to
//!   registered listeners
//! - remote shell redirection into local stdout/stderr sinks plus a stdin
//!   pump
//!
//! # Quick Start
//!
//! ```no_run
//! use agentport::config::SocketParams;
//! use agentport::supervisor::RpcSupervisor;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let supervisor = RpcSupervisor::new();
//!     let params = SocketParams::new("localhost", 36729, 5000);
//!     supervisor.connect_socket(&params).await?;
//!
//!     let agent = supervisor.agent().await?;
//!     assert!(agent.ping().await?);
//!
//!     supervisor.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod retry;
pub mod rpc;
pub mod supervisor;
pub mod testing;
pub mod transport;

pub use auth::{Clock, SystemClock, TokenConfig, TokenProvider};
pub use config::{BrokerParams, ConnectionParams, ConsoleConfig, RetryConfig, SocketParams};
pub use error::{SupervisorError, SupervisorResult};
pub use protocol::{AgentEvent, AgentLogEntry, LogLevel};
pub use rpc::AgentStub;
pub use supervisor::{EventListener, LogListener, OutputSink, RpcSupervisor};
pub use transport::{Transport, TransportKind, TransportState};
