//! The supervisor façade
//!
//! [`RpcSupervisor`] composes the connection state machine, the OAuth2 token
//! provider (broker path) and the event/log dispatch layer behind the
//! surface the rest of the application sees: connect, disconnect, the remote
//! stub, listener registration and stream redirection.

use crate::config::{BrokerParams, RetryConfig, SocketParams};
use crate::error::SupervisorResult;
use crate::protocol::{AgentEvent, AgentLogEntry, AGENT_CONNECTED_TOPIC, AGENT_DISCONNECTED_TOPIC};
use crate::rpc::{AgentStub, Inbound};
use crate::transport::TransportKind;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod connection;
pub mod dispatch;

pub use connection::ConnectionSupervisor;
pub use dispatch::{EventListener, ListenerRegistry, LogListener};

/// Sink for redirected remote stdout/stderr
pub trait OutputSink: Send + Sync {
    fn append(&self, text: &str);
}

/// Initial shell channel id; always invalid so the first redirect
/// propagates
const INITIAL_SHELL: i32 = -100;

/// Bound on how long a best-effort remote disconnect may stall teardown
const REMOTE_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const INBOUND_BUFFER: usize = 256;

#[derive(Default)]
struct StreamSinks {
    stdout: StdMutex<Option<Arc<dyn OutputSink>>>,
    stderr: StdMutex<Option<Arc<dyn OutputSink>>>,
}

impl StreamSinks {
    fn write_stdout(&self, text: &str) {
        if let Some(sink) = self.stdout.lock().expect("sink lock poisoned").as_ref() {
            sink.append(text);
        }
    }

    fn write_stderr(&self, text: &str) {
        if let Some(sink) = self.stderr.lock().expect("sink lock poisoned").as_ref() {
            sink.append(text);
        }
    }
}

pub struct RpcSupervisor {
    connection: Mutex<ConnectionSupervisor>,
    registry: Arc<ListenerRegistry>,
    sinks: Arc<StreamSinks>,
    shell: AtomicI32,
    retry: RetryConfig,
    dispatch_task: StdMutex<Option<JoinHandle<()>>>,
    stdin_task: StdMutex<Option<JoinHandle<()>>>,
}

impl RpcSupervisor {
    pub fn new() -> Self {
        Self::with_retry(RetryConfig::default())
    }

    /// Use the given socket retry strategy instead of the default linear
    /// countdown
    pub fn with_retry(retry: RetryConfig) -> Self {
        Self {
            connection: Mutex::new(ConnectionSupervisor::new()),
            registry: Arc::new(ListenerRegistry::new()),
            sinks: Arc::new(StreamSinks::default()),
            shell: AtomicI32::new(INITIAL_SHELL),
            retry,
            dispatch_task: StdMutex::new(None),
            stdin_task: StdMutex::new(None),
        }
    }

    /// Connect over a raw socket; returns once a usable stub exists or the
    /// retry budget is exhausted
    pub async fn connect_socket(&self, params: &SocketParams) -> SupervisorResult<()> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        {
            let mut connection = self.connection.lock().await;
            connection
                .connect_socket(params, &self.retry, inbound_tx)
                .await?;
        }
        self.start_dispatch(inbound_rx);
        self.registry
            .dispatch_event(&AgentEvent::lifecycle(AGENT_CONNECTED_TOPIC));
        info!(host = %params.host, port = params.port, "agent connected via socket");
        Ok(())
    }

    /// Connect through the MQTT broker; returns once the broker
    /// acknowledged the session or the configured timeout elapsed
    pub async fn connect_broker(&self, params: &BrokerParams) -> SupervisorResult<()> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        {
            let mut connection = self.connection.lock().await;
            connection.connect_broker(params, inbound_tx).await?;
        }
        self.start_dispatch(inbound_rx);
        self.registry
            .dispatch_event(&AgentEvent::lifecycle(AGENT_CONNECTED_TOPIC));
        info!(server = %params.server, port = params.port, "agent connected via broker");
        Ok(())
    }

    fn start_dispatch(&self, mut inbound_rx: mpsc::Receiver<Inbound>) {
        let registry = self.registry.clone();
        let sinks = self.sinks.clone();
        let handle = tokio::spawn(async move {
            while let Some(inbound) = inbound_rx.recv().await {
                match inbound {
                    Inbound::Event(event) => registry.dispatch_event(&event),
                    Inbound::Log(entry) => registry.dispatch_log(&entry),
                    Inbound::Stdout(text) => sinks.write_stdout(&text),
                    Inbound::Stderr(text) => sinks.write_stderr(&text),
                    Inbound::Disconnected { reason } => {
                        warn!("agent connection lost: {reason}");
                        registry
                            .dispatch_event(&AgentEvent::lifecycle(AGENT_DISCONNECTED_TOPIC));
                    }
                }
            }
        });
        let mut slot = self.dispatch_task.lock().expect("task slot poisoned");
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    pub async fn is_open(&self) -> bool {
        self.connection.lock().await.is_open()
    }

    /// Which transport carries the active session, if any
    pub async fn kind(&self) -> Option<TransportKind> {
        self.connection.lock().await.kind()
    }

    /// The remote stub; fails loudly when no session is open
    pub async fn agent(&self) -> SupervisorResult<AgentStub> {
        self.connection.lock().await.stub()
    }

    /// Gracefully end the session. The remote disconnect is best-effort;
    /// local state is cleared even when the peer or the transport
    /// misbehaves.
    pub async fn disconnect(&self) -> SupervisorResult<()> {
        let mut connection = self.connection.lock().await;
        if let Ok(stub) = connection.stub() {
            let remote =
                tokio::time::timeout(REMOTE_DISCONNECT_TIMEOUT, stub.disconnect()).await;
            match remote {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("remote disconnect call failed: {e}"),
                Err(_elapsed) => warn!("remote disconnect call timed out"),
            }
        }
        let result = connection.disconnect().await;
        drop(connection);

        if let Some(task) = self.stdin_task.lock().expect("task slot poisoned").take() {
            task.abort();
        }
        if let Some(task) = self.dispatch_task.lock().expect("task slot poisoned").take() {
            task.abort();
        }
        self.shell.store(INITIAL_SHELL, Ordering::SeqCst);
        info!("agent disconnected");
        result
    }

    pub fn add_event_listener(&self, listener: Arc<dyn EventListener>) {
        self.registry.add_event_listener(listener);
    }

    pub fn remove_event_listener(&self, listener: &Arc<dyn EventListener>) {
        self.registry.remove_event_listener(listener);
    }

    pub fn add_log_listener(&self, listener: Arc<dyn LogListener>) {
        self.registry.add_log_listener(listener);
    }

    pub fn remove_log_listener(&self, listener: &Arc<dyn LogListener>) {
        self.registry.remove_log_listener(listener);
    }

    /// Deliver an inbound framework event to matching listeners; called by
    /// the dispatch task, public so event sources can inject directly
    pub fn on_event(&self, event: &AgentEvent) {
        self.registry.dispatch_event(event);
    }

    /// Deliver a log record to every log listener
    pub fn logged(&self, entry: &AgentLogEntry) {
        self.registry.dispatch_log(entry);
    }

    /// Install local sinks for the agent's redirected stdout/stderr and ask
    /// the peer to start redirecting its shell output
    pub async fn set_streams(
        &self,
        out: Arc<dyn OutputSink>,
        err: Arc<dyn OutputSink>,
    ) -> SupervisorResult<()> {
        self.set_stdout(out);
        self.set_stderr(err);
        let stub = self.agent().await?;
        stub.redirect(self.shell.load(Ordering::SeqCst)).await?;
        Ok(())
    }

    pub fn set_stdout(&self, out: Arc<dyn OutputSink>) {
        *self.sinks.stdout.lock().expect("sink lock poisoned") = Some(out);
    }

    pub fn set_stderr(&self, err: Arc<dyn OutputSink>) {
        *self.sinks.stderr.lock().expect("sink lock poisoned") = Some(err);
    }

    /// The shell channel to redirect to: negative attaches to an existing
    /// local command session, 0 the standard console, positive opens a
    /// stream on that port
    pub fn set_shell(&self, shell: i32) {
        self.shell.store(shell, Ordering::SeqCst);
    }

    /// Switch the redirection target; a no-op when the channel is unchanged
    /// or no session is open
    pub async fn redirect(&self, shell: i32) -> SupervisorResult<()> {
        if self.shell.load(Ordering::SeqCst) == shell {
            return Ok(());
        }
        if let Ok(stub) = self.agent().await {
            stub.redirect(shell).await?;
            self.shell.store(shell, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Spawn the single background pump forwarding local input to the
    /// agent; it ends on EOF, on a dead channel, or when the session is
    /// torn down
    pub async fn set_stdin<R>(&self, reader: R) -> SupervisorResult<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let stub = self.agent().await?;
        let handle = tokio::spawn(async move {
            let mut reader = reader;
            let mut buf = vec![0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                        if stub.stdin(&chunk).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("stdin pump read failed: {e}");
                        break;
                    }
                }
            }
        });
        let mut slot = self.stdin_task.lock().expect("task slot poisoned");
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
        Ok(())
    }
}

impl Default for RpcSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RpcSupervisor {
    fn drop(&mut self) {
        // disconnect() may never have been called; reap background tasks
        if let Ok(mut slot) = self.stdin_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        if let Ok(mut slot) = self.dispatch_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}
