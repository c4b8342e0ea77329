//! Request/response plumbing shared by both transports
//!
//! [`AgentStub`] is the remote stub: a cloneable handle that issues
//! correlated request frames over the transport's outbound channel and
//! awaits the matching response. [`RpcRouter`] owns the pending-request map
//! and fans every non-response frame into the supervisor's inbound channel.

use crate::error::{SupervisorError, SupervisorResult};
use crate::protocol::{AgentEvent, AgentLogEntry, Frame};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, warn};

/// Upper bound on how long a single RPC call may stay in flight
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Anything the transport hands upward besides RPC responses
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(AgentEvent),
    Log(AgentLogEntry),
    Stdout(String),
    Stderr(String),
    /// The peer is gone: socket EOF, broker disconnect, or a last-will
    /// message observed on the configured topic
    Disconnected { reason: String },
}

type PendingMap = Mutex<HashMap<uuid::Uuid, oneshot::Sender<Result<Value, String>>>>;

/// Resolves responses against pending calls and forwards inbound traffic
pub struct RpcRouter {
    pending: PendingMap,
    inbound_tx: mpsc::Sender<Inbound>,
}

impl RpcRouter {
    pub fn new(inbound_tx: mpsc::Sender<Inbound>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            inbound_tx,
        }
    }

    fn register(&self, id: uuid::Uuid) -> oneshot::Receiver<Result<Value, String>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending map poisoned").insert(id, tx);
        rx
    }

    fn unregister(&self, id: uuid::Uuid) {
        self.pending.lock().expect("pending map poisoned").remove(&id);
    }

    /// Route one frame received from the peer
    pub async fn route_frame(&self, frame: Frame) {
        match frame {
            Frame::Response { id, result, error } => {
                let sender = self.pending.lock().expect("pending map poisoned").remove(&id);
                match sender {
                    Some(tx) => {
                        let outcome = match error {
                            Some(message) => Err(message),
                            None => Ok(result.unwrap_or(Value::Null)),
                        };
                        let _ = tx.send(outcome);
                    }
                    None => debug!(%id, "response for unknown or timed-out request"),
                }
            }
            Frame::Event { event } => self.forward(Inbound::Event(event)).await,
            Frame::Log { entry } => self.forward(Inbound::Log(entry)).await,
            Frame::Stdout { text } => self.forward(Inbound::Stdout(text)).await,
            Frame::Stderr { text } => self.forward(Inbound::Stderr(text)).await,
            Frame::Request { method, .. } => {
                warn!(method, "peer sent a request frame; console side ignores it");
            }
        }
    }

    /// Report peer loss without failing in-flight calls (they time out on
    /// their own); used for last-will notifications
    pub async fn notify_disconnected(&self, reason: &str) {
        self.forward(Inbound::Disconnected {
            reason: reason.to_string(),
        })
        .await;
    }

    /// The channel itself is gone: fail every pending call and report the
    /// disconnect upward
    pub async fn peer_closed(&self, reason: &str) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(reason.to_string()));
        }
        self.notify_disconnected(reason).await;
    }

    async fn forward(&self, inbound: Inbound) {
        if self.inbound_tx.send(inbound).await.is_err() {
            debug!("inbound channel closed; dropping message");
        }
    }
}

/// The remote stub: the single handle through which the agent's interface
/// is invoked while the owning transport is open
#[derive(Clone)]
pub struct AgentStub {
    outbound: mpsc::Sender<Frame>,
    router: Arc<RpcRouter>,
    in_flight: Arc<Semaphore>,
    call_timeout: Duration,
}

impl AgentStub {
    pub fn new(
        outbound: mpsc::Sender<Frame>,
        router: Arc<RpcRouter>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            outbound,
            router,
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Invoke a remote operation and await its response
    pub async fn call(&self, method: &str, params: Value) -> SupervisorResult<Value> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| SupervisorError::NotConnected)?;

        let id = uuid::Uuid::new_v4();
        let response = self.router.register(id);
        let frame = Frame::Request {
            id,
            method: method.to_string(),
            params,
        };
        if self.outbound.send(frame).await.is_err() {
            self.router.unregister(id);
            return Err(SupervisorError::NotConnected);
        }

        match tokio::time::timeout(self.call_timeout, response).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(SupervisorError::rpc(message)),
            Ok(Err(_closed)) => Err(SupervisorError::rpc("connection closed during call")),
            Err(_elapsed) => {
                self.router.unregister(id);
                Err(SupervisorError::rpc(format!(
                    "'{method}' timed out after {} ms",
                    self.call_timeout.as_millis()
                )))
            }
        }
    }

    /// Liveness probe
    pub async fn ping(&self) -> SupervisorResult<bool> {
        let value = self.call("ping", Value::Null).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Ask the agent to tear down its side of the session
    pub async fn disconnect(&self) -> SupervisorResult<()> {
        self.call("disconnect", Value::Null).await.map(|_| ())
    }

    /// Redirect the agent's shell output to the given channel: negative
    /// attaches to an existing local command session, 0 the standard
    /// console, positive opens a stream on that port
    pub async fn redirect(&self, shell: i32) -> SupervisorResult<bool> {
        let value = self.call("redirect", json!({ "shell": shell })).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Forward accumulated console input to the agent
    pub async fn stdin(&self, text: &str) -> SupervisorResult<()> {
        self.call("stdin", json!({ "text": text })).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn stub_with_channels() -> (AgentStub, mpsc::Receiver<Frame>, Arc<RpcRouter>, mpsc::Receiver<Inbound>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(8);
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let router = Arc::new(RpcRouter::new(inbound_tx));
        let stub = AgentStub::new(outbound_tx, router.clone(), 5)
            .with_call_timeout(Duration::from_millis(200));
        (stub, outbound_rx, router, inbound_rx)
    }

    #[tokio::test]
    async fn test_call_resolves_on_matching_response() {
        let (stub, mut outbound_rx, router, _inbound_rx) = stub_with_channels();

        let call = tokio::spawn(async move { stub.ping().await });

        let frame = outbound_rx.recv().await.expect("request frame");
        let id = match frame {
            Frame::Request { id, ref method, .. } => {
                assert_eq!(method, "ping");
                id
            }
            other => panic!("expected request, got {other:?}"),
        };

        router
            .route_frame(Frame::Response {
                id,
                result: Some(Value::Bool(true)),
                error: None,
            })
            .await;

        assert!(call.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_call_surfaces_remote_error() {
        let (stub, mut outbound_rx, router, _inbound_rx) = stub_with_channels();

        let call = tokio::spawn(async move { stub.call("redirect", Value::Null).await });

        let id = match outbound_rx.recv().await.unwrap() {
            Frame::Request { id, .. } => id,
            other => panic!("expected request, got {other:?}"),
        };
        router
            .route_frame(Frame::Response {
                id,
                result: None,
                error: Some("shell unavailable".to_string()),
            })
            .await;

        let error = call.await.unwrap().unwrap_err();
        assert!(matches!(error, SupervisorError::Rpc { .. }));
        assert!(error.to_string().contains("shell unavailable"));
    }

    #[tokio::test]
    async fn test_call_times_out_and_unregisters() {
        let (stub, mut outbound_rx, router, _inbound_rx) = stub_with_channels();

        let result = stub.call("ping", Value::Null).await;
        assert!(matches!(result, Err(SupervisorError::Rpc { .. })));

        // a late response for the timed-out id is dropped without effect
        let id = match outbound_rx.recv().await.unwrap() {
            Frame::Request { id, .. } => id,
            other => panic!("expected request, got {other:?}"),
        };
        router
            .route_frame(Frame::Response {
                id,
                result: Some(Value::Null),
                error: None,
            })
            .await;
    }

    #[tokio::test]
    async fn test_peer_closed_fails_pending_calls() {
        let (stub, mut outbound_rx, router, mut inbound_rx) = stub_with_channels();

        let call = tokio::spawn(async move { stub.ping().await });
        let _ = outbound_rx.recv().await.unwrap();

        router.peer_closed("connection reset").await;

        let error = call.await.unwrap().unwrap_err();
        assert!(error.to_string().contains("connection reset"));
        assert_eq!(
            inbound_rx.recv().await,
            Some(Inbound::Disconnected {
                reason: "connection reset".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_inbound_frames_are_forwarded_in_order() {
        let (_stub, _outbound_rx, router, mut inbound_rx) = stub_with_channels();

        router
            .route_frame(Frame::Stdout {
                text: "first".to_string(),
            })
            .await;
        router
            .route_frame(Frame::Event {
                event: AgentEvent {
                    topic: "bundle/INSTALLED".to_string(),
                    properties: Default::default(),
                    received_at: Utc::now(),
                },
            })
            .await;
        router
            .route_frame(Frame::Stderr {
                text: "second".to_string(),
            })
            .await;

        assert_eq!(inbound_rx.recv().await, Some(Inbound::Stdout("first".to_string())));
        assert!(matches!(inbound_rx.recv().await, Some(Inbound::Event(_))));
        assert_eq!(inbound_rx.recv().await, Some(Inbound::Stderr("second".to_string())));
    }
}
