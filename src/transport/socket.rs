//! Raw socket transport (TCP, optionally TLS)
//!
//! Frames are newline-delimited JSON. TLS trust is an explicit per-connect
//! [`TlsConfig`] value built from a PEM bundle; nothing about a connect
//! attempt touches process-global state, so concurrent attempts cannot
//! contaminate each other.

use crate::config::SocketParams;
use crate::error::{SupervisorError, SupervisorResult};
use crate::protocol::Frame;
use crate::rpc::{AgentStub, Inbound, RpcRouter};
use crate::transport::{Transport, TransportKind};
use std::io::BufReader as StdBufReader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::rustls;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// In-flight RPC cap for the socket channel
const MAX_IN_FLIGHT: usize = 30;

/// Per-attempt connect timeout when the caller's budget is unbounded
const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

const OUTBOUND_BUFFER: usize = 64;

/// Explicit TLS trust for one connect attempt
pub struct TlsConfig {
    connector: TlsConnector,
    server_name: rustls::pki_types::ServerName<'static>,
}

impl TlsConfig {
    /// Build TLS trust from the socket parameters: the PEM bundle when a
    /// trust store is configured, the webpki root set otherwise. Returns
    /// `None` when the parameters do not ask for TLS at all.
    pub fn from_params(params: &SocketParams) -> SupervisorResult<Option<Self>> {
        if !params.tls && params.trust_store.is_none() {
            return Ok(None);
        }
        install_crypto_provider();

        let root_store = match &params.trust_store {
            Some(path) => {
                let file = std::fs::File::open(path).map_err(|e| {
                    SupervisorError::configuration(format!(
                        "cannot read trust store {}: {e}",
                        path.display()
                    ))
                })?;
                let mut reader = StdBufReader::new(file);
                let mut store = rustls::RootCertStore::empty();
                for cert in rustls_pemfile::certs(&mut reader) {
                    let cert = cert.map_err(|e| {
                        SupervisorError::configuration(format!(
                            "invalid certificate in {}: {e}",
                            path.display()
                        ))
                    })?;
                    store.add(cert).map_err(|e| {
                        SupervisorError::configuration(format!(
                            "rejected certificate in {}: {e}",
                            path.display()
                        ))
                    })?;
                }
                if store.is_empty() {
                    return Err(SupervisorError::configuration(format!(
                        "trust store {} contains no certificates",
                        path.display()
                    )));
                }
                store
            }
            None => {
                rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned())
            }
        };

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let server_name = rustls::pki_types::ServerName::try_from(params.host.clone())
            .map_err(|_| {
                SupervisorError::configuration(format!("invalid TLS server name '{}'", params.host))
            })?;

        Ok(Some(Self {
            connector: TlsConnector::from(Arc::new(tls_config)),
            server_name,
        }))
    }
}

fn install_crypto_provider() {
    static INSTALL: std::sync::Once = std::sync::Once::new();
    INSTALL.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// One open socket channel to the agent
pub struct SocketTransport {
    stub: AgentStub,
    open: Arc<AtomicBool>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

impl SocketTransport {
    /// Perform a single connect attempt and open the channel.
    ///
    /// Connection-refused comes back as a retryable `Connect` error; the
    /// retry loop itself belongs to the connection supervisor.
    pub async fn open(
        params: &SocketParams,
        tls: Option<&TlsConfig>,
        inbound_tx: mpsc::Sender<Inbound>,
    ) -> SupervisorResult<Self> {
        let attempt_timeout = if params.timeout > 0 {
            Duration::from_millis(params.timeout as u64)
        } else {
            DEFAULT_ATTEMPT_TIMEOUT
        };

        let address = (params.host.as_str(), params.port);
        let tcp = match tokio::time::timeout(attempt_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(SupervisorError::connect(format!(
                    "connection refused by {}:{}",
                    params.host, params.port
                )));
            }
            Ok(Err(e)) => {
                return Err(SupervisorError::connect(format!(
                    "cannot reach {}:{}: {e}",
                    params.host, params.port
                )));
            }
            Err(_elapsed) => {
                return Err(SupervisorError::connect(format!(
                    "connect attempt to {}:{} timed out",
                    params.host, params.port
                )));
            }
        };
        tcp.set_nodelay(true)
            .map_err(|e| SupervisorError::connect(format!("socket options: {e}")))?;

        let stream: Box<dyn AsyncStream> = match tls {
            Some(tls) => {
                let tls_stream = tls
                    .connector
                    .connect(tls.server_name.clone(), tcp)
                    .await
                    .map_err(|e| {
                        SupervisorError::connect(format!(
                            "TLS handshake with {}:{} failed: {e}",
                            params.host, params.port
                        ))
                    })?;
                debug!(host = %params.host, "TLS handshake complete");
                Box::new(tls_stream)
            }
            None => Box::new(tcp),
        };

        info!(host = %params.host, port = params.port, "socket channel established");
        Ok(Self::start(stream, inbound_tx))
    }

    fn start(stream: Box<dyn AsyncStream>, inbound_tx: mpsc::Sender<Inbound>) -> Self {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_BUFFER);
        let router = Arc::new(RpcRouter::new(inbound_tx));
        let open = Arc::new(AtomicBool::new(true));

        let writer_open = open.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let mut line = match serde_json::to_string(&frame) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("dropping unserializable frame: {e}");
                        continue;
                    }
                };
                line.push('\n');
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
            writer_open.store(false, Ordering::SeqCst);
        });

        let reader_open = open.clone();
        let reader_router = router.clone();
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            let reason = loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match serde_json::from_str::<Frame>(&line) {
                        Ok(frame) => reader_router.route_frame(frame).await,
                        Err(e) => warn!("undecodable frame from agent: {e}"),
                    },
                    Ok(None) => break "connection closed by peer".to_string(),
                    Err(e) => break format!("read failed: {e}"),
                }
            };
            if reader_open.swap(false, Ordering::SeqCst) {
                reader_router.peer_closed(&reason).await;
            }
        });

        let stub = AgentStub::new(outbound_tx, router, MAX_IN_FLIGHT);
        Self {
            stub,
            open,
            reader_task: Some(reader_task),
            writer_task: Some(writer_task),
        }
    }
}

#[async_trait::async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn stub(&self) -> AgentStub {
        self.stub.clone()
    }

    async fn close(&mut self) -> SupervisorResult<()> {
        self.open.store(false, Ordering::SeqCst);
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        info!("socket channel closed");
        Ok(())
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        // close() may never have been called; reap the I/O tasks
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}
