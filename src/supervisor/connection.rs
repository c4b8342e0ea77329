//! Connect/retry state machine shared by both transports
//!
//! Owns the single active transport and the credential resolution for the
//! broker path. Exactly one transport is live at a time; connecting while a
//! session is open is refused rather than silently torn down.

use crate::auth::TokenProvider;
use crate::config::{BrokerParams, RetryConfig, SocketParams};
use crate::error::{SupervisorError, SupervisorResult};
use crate::retry::policy_for;
use crate::rpc::{AgentStub, Inbound};
use crate::transport::{
    BrokerTransport, Credentials, SocketTransport, TlsConfig, Transport, TransportKind,
    TransportState,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct ConnectionSupervisor {
    active: Option<Box<dyn Transport>>,
    state: TransportState,
}

impl ConnectionSupervisor {
    pub fn new() -> Self {
        Self {
            active: None,
            state: TransportState::Disconnected,
        }
    }

    /// True while an active transport reports its channel usable
    pub fn is_open(&self) -> bool {
        self.active.as_ref().is_some_and(|t| t.is_open())
    }

    pub fn state(&self) -> TransportState {
        if self.is_open() {
            TransportState::Open
        } else {
            self.state
        }
    }

    pub fn kind(&self) -> Option<TransportKind> {
        self.active.as_ref().map(|t| t.kind())
    }

    /// The remote stub of the active session
    pub fn stub(&self) -> SupervisorResult<AgentStub> {
        match self.active.as_ref() {
            Some(transport) if transport.is_open() => Ok(transport.stub()),
            _ => Err(SupervisorError::NotConnected),
        }
    }

    fn check_not_connected(&self) -> SupervisorResult<()> {
        if self.is_open() {
            return Err(SupervisorError::AlreadyConnected);
        }
        Ok(())
    }

    /// Socket path: retry connection-refused errors per the configured
    /// policy until success or exhaustion, then fail with a connect error.
    pub async fn connect_socket(
        &mut self,
        params: &SocketParams,
        retry: &RetryConfig,
        inbound_tx: mpsc::Sender<Inbound>,
    ) -> SupervisorResult<AgentStub> {
        self.check_not_connected()?;
        params.validate()?;
        self.state = TransportState::Connecting;

        // TLS trust is scoped to this attempt; nothing global to clean up
        let tls = match TlsConfig::from_params(params) {
            Ok(tls) => tls,
            Err(e) => {
                self.state = TransportState::Disconnected;
                return Err(e);
            }
        };

        let mut policy = policy_for(retry, params.timeout);
        let mut attempt = 1u32;
        loop {
            match SocketTransport::open(params, tls.as_ref(), inbound_tx.clone()).await {
                Ok(transport) => {
                    let stub = transport.stub();
                    self.active = Some(Box::new(transport));
                    self.state = TransportState::Open;
                    return Ok(stub);
                }
                Err(e) if e.is_connection_refused() => match policy.next_delay() {
                    Some(delay) => {
                        debug!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "connection refused, retrying"
                        );
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        self.state = TransportState::Disconnected;
                        return Err(SupervisorError::connect(format!(
                            "{}:{} kept refusing connections ({attempt} attempts)",
                            params.host, params.port
                        )));
                    }
                },
                Err(e) => {
                    self.state = TransportState::Disconnected;
                    return Err(e);
                }
            }
        }
    }

    /// Broker path: resolve credentials, open the transport, and block on
    /// the pending connection until ConnAck or timeout.
    pub async fn connect_broker(
        &mut self,
        params: &BrokerParams,
        inbound_tx: mpsc::Sender<Inbound>,
    ) -> SupervisorResult<AgentStub> {
        self.check_not_connected()?;
        params.validate()?;
        self.state = TransportState::Connecting;

        let credentials = match self.resolve_credentials(params).await {
            Ok(credentials) => credentials,
            Err(e) => {
                self.state = TransportState::Disconnected;
                return Err(e);
            }
        };

        match BrokerTransport::open(params, credentials, inbound_tx).await {
            Ok(transport) => {
                let stub = transport.stub();
                self.active = Some(Box::new(transport));
                self.state = TransportState::Open;
                Ok(stub)
            }
            Err(e) => {
                self.state = TransportState::Disconnected;
                Err(e)
            }
        }
    }

    /// Plain password when supplied, else a bearer token from the OAuth2
    /// configuration, else no authentication at all
    async fn resolve_credentials(
        &self,
        params: &BrokerParams,
    ) -> SupervisorResult<Option<Credentials>> {
        let Some(username) = params.username.as_ref().filter(|u| !u.is_empty()) else {
            return Ok(None);
        };

        if let Some(password) = params.password.as_ref().filter(|p| !p.is_empty()) {
            return Ok(Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }));
        }

        if let Some(token_config) = &params.token {
            let mut token_config = token_config.clone();
            if token_config.client_id.is_empty() {
                token_config.client_id = params.client_id.clone();
            }
            let provider = TokenProvider::new(token_config)?;
            let token = provider.get().await?;
            info!("broker password resolved via OAuth2 token endpoint");
            return Ok(Some(Credentials {
                username: username.clone(),
                password: token,
            }));
        }

        Ok(None)
    }

    /// Tear down the active transport. State is cleared unconditionally,
    /// even when the close itself fails.
    pub async fn disconnect(&mut self) -> SupervisorResult<()> {
        let result = match self.active.take() {
            Some(mut transport) => transport.close().await,
            None => Ok(()),
        };
        self.state = TransportState::Disconnected;
        if let Err(e) = &result {
            warn!("transport close failed: {e}");
        }
        result
    }
}

impl Default for ConnectionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use std::time::Instant;

    fn refused_params(timeout: i64) -> SocketParams {
        // bind-then-drop guarantees a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        SocketParams::new("127.0.0.1", port, timeout)
    }

    #[tokio::test]
    async fn test_initial_state() {
        let supervisor = ConnectionSupervisor::new();
        assert!(!supervisor.is_open());
        assert_eq!(supervisor.state(), TransportState::Disconnected);
        assert!(supervisor.kind().is_none());
        assert!(matches!(
            supervisor.stub(),
            Err(SupervisorError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_refused_connect_terminates_within_budget() {
        let mut supervisor = ConnectionSupervisor::new();
        let (inbound_tx, _inbound_rx) = mpsc::channel(8);
        let params = refused_params(500);

        let started = Instant::now();
        let result = supervisor
            .connect_socket(&params, &RetryConfig::default(), inbound_tx)
            .await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(SupervisorError::Connect { .. })));
        assert!(
            elapsed < std::time::Duration::from_millis(2000),
            "retry loop must respect the timeout budget, took {elapsed:?}"
        );
        assert_eq!(supervisor.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_zero_timeout_is_a_single_attempt() {
        let mut supervisor = ConnectionSupervisor::new();
        let (inbound_tx, _inbound_rx) = mpsc::channel(8);
        let params = refused_params(0);

        let started = Instant::now();
        let result = supervisor
            .connect_socket(&params, &RetryConfig::default(), inbound_tx)
            .await;

        assert!(result.is_err());
        assert!(started.elapsed() < std::time::Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_invalid_params_fail_fast() {
        let mut supervisor = ConnectionSupervisor::new();
        let (inbound_tx, _inbound_rx) = mpsc::channel(8);
        let mut params = SocketParams::new("", 1, 100);
        params.timeout = -2;

        let result = supervisor
            .connect_socket(&params, &RetryConfig::default(), inbound_tx)
            .await;
        assert!(matches!(
            result,
            Err(SupervisorError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_a_noop() {
        let mut supervisor = ConnectionSupervisor::new();
        assert!(supervisor.disconnect().await.is_ok());
        assert_eq!(supervisor.state(), TransportState::Disconnected);
    }
}
