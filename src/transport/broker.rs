//! MQTT broker transport
//!
//! The broker client connects with a clean-start session and **no automatic
//! reconnect**: reconnection policy belongs to the supervisor, not the
//! messaging layer. Commands go out on the configured publish topic,
//! responses and events arrive on the subscribe topic, and an optional
//! last-will topic converts a broker-observed agent loss into a local
//! disconnect notification.

use crate::config::BrokerParams;
use crate::error::{SupervisorError, SupervisorResult};
use crate::protocol::Frame;
use crate::rpc::{AgentStub, RpcRouter, Inbound};
use crate::transport::{Transport, TransportKind};
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, Event, EventLoop, MqttOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Concurrent in-flight sends over the broker channel
const MAX_IN_FLIGHT: usize = 5;

/// Support large state snapshots from the agent; the common broker default
/// of 10 KiB is far too small
const MAX_PACKET_SIZE: u32 = 256 * 1024;

const KEEP_ALIVE: Duration = Duration::from_secs(60);

const OUTBOUND_BUFFER: usize = 64;

/// Resolved simple-auth credentials
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Connection lifecycle of the broker link
#[derive(Debug, Clone, PartialEq)]
enum LinkState {
    Connecting,
    Connected,
    Disconnected(String),
}

/// Session expiry stays at the protocol default of 0: the session ends with
/// the network connection, matching the clean-start requirement.
fn configure_options(params: &BrokerParams, credentials: Option<&Credentials>) -> MqttOptions {
    let mut options = MqttOptions::new(&params.client_id, &params.server, params.port);
    options.set_clean_start(true);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_max_packet_size(Some(MAX_PACKET_SIZE));
    if let Some(credentials) = credentials {
        options.set_credentials(&credentials.username, &credentials.password);
    }
    options
}

/// One open MQTT channel to the agent
pub struct BrokerTransport {
    client: AsyncClient,
    stub: AgentStub,
    state_rx: watch::Receiver<LinkState>,
    shutdown_tx: watch::Sender<bool>,
    event_loop_task: Option<JoinHandle<()>>,
    publisher_task: Option<JoinHandle<()>>,
}

impl BrokerTransport {
    /// Open the channel and block until the broker acknowledges the
    /// connection or the configured timeout elapses.
    ///
    /// The event loop only starts once the fully built options are committed
    /// to the client, so the messaging layer can never run against a
    /// half-configured session. The connect wait is a single-resolution
    /// future over the link-state channel: resolved by ConnAck, failed by a
    /// disconnect reason, or timed out -- in which case the event loop is
    /// reaped and no subscription state survives the failed attempt.
    pub async fn open(
        params: &BrokerParams,
        credentials: Option<Credentials>,
        inbound_tx: mpsc::Sender<Inbound>,
    ) -> SupervisorResult<Self> {
        let options = configure_options(params, credentials.as_ref());
        let (client, event_loop) = AsyncClient::new(options, 10);

        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_BUFFER);
        let router = Arc::new(RpcRouter::new(inbound_tx));

        let event_loop_task = tokio::spawn(Self::run_event_loop(
            event_loop,
            state_tx,
            shutdown_rx,
            router.clone(),
            params.sub_topic.clone(),
            params.lwt_topic.clone(),
        ));
        let publisher_task = tokio::spawn(Self::run_publisher(
            client.clone(),
            params.pub_topic.clone(),
            outbound_rx,
        ));

        let stub = AgentStub::new(outbound_tx, router, MAX_IN_FLIGHT);
        let mut transport = Self {
            client,
            stub,
            state_rx: state_rx.clone(),
            shutdown_tx,
            event_loop_task: Some(event_loop_task),
            publisher_task: Some(publisher_task),
        };

        let timeout = Duration::from_millis(params.timeout);
        if let Err(e) = Self::wait_for_connection(state_rx, timeout).await {
            transport.reap_tasks();
            return Err(e);
        }

        transport.subscribe(&params.sub_topic).await?;
        if let Some(lwt_topic) = &params.lwt_topic {
            transport.subscribe(lwt_topic).await?;
        }

        info!(server = %params.server, port = params.port, "broker channel established");
        Ok(transport)
    }

    async fn subscribe(&mut self, topic: &str) -> SupervisorResult<()> {
        if let Err(e) = self.client.subscribe(topic, QoS::AtLeastOnce).await {
            self.reap_tasks();
            return Err(SupervisorError::connect(format!(
                "cannot subscribe to '{topic}': {e}"
            )));
        }
        debug!(topic, "subscribed");
        Ok(())
    }

    /// Wait for the ConnAck-driven state change bounded by the connect
    /// timeout
    async fn wait_for_connection(
        mut state_rx: watch::Receiver<LinkState>,
        timeout: Duration,
    ) -> SupervisorResult<()> {
        let wait = async {
            loop {
                let state = state_rx.borrow().clone();
                match state {
                    LinkState::Connected => return Ok(()),
                    LinkState::Disconnected(reason) => {
                        return Err(SupervisorError::connect(reason));
                    }
                    LinkState::Connecting => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(SupervisorError::connect("link state channel closed"));
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_elapsed) => Err(SupervisorError::ConnectTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn run_event_loop(
        mut event_loop: EventLoop,
        state_tx: watch::Sender<LinkState>,
        mut shutdown_rx: watch::Receiver<bool>,
        router: Arc<RpcRouter>,
        sub_topic: String,
        lwt_topic: Option<String>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("shutdown signal received, stopping broker event loop");
                        break;
                    }
                }
                event = event_loop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        let _ = state_tx.send(LinkState::Connected);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let topic = String::from_utf8_lossy(&publish.topic).to_string();
                        if lwt_topic.as_deref() == Some(topic.as_str()) {
                            info!("last-will received: agent disconnected ungracefully");
                            router.notify_disconnected("agent last-will received").await;
                        } else if topic == sub_topic {
                            match serde_json::from_slice::<Frame>(&publish.payload) {
                                Ok(frame) => router.route_frame(frame).await,
                                Err(e) => warn!("undecodable frame from agent: {e}"),
                            }
                        } else {
                            debug!(topic, "message on unexpected topic ignored");
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect(_))) => {
                        let reason = "disconnected by broker".to_string();
                        let _ = state_tx.send(LinkState::Disconnected(reason.clone()));
                        router.peer_closed(&reason).await;
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let reason = format!("broker connection lost: {e}");
                        error!("{reason}");
                        let _ = state_tx.send(LinkState::Disconnected(reason.clone()));
                        router.peer_closed(&reason).await;
                        break;
                    }
                }
            }
        }
    }

    async fn run_publisher(
        client: AsyncClient,
        pub_topic: String,
        mut outbound_rx: mpsc::Receiver<Frame>,
    ) {
        while let Some(frame) = outbound_rx.recv().await {
            let payload: bytes::Bytes = match serde_json::to_vec(&frame) {
                Ok(payload) => payload.into(),
                Err(e) => {
                    warn!("dropping unserializable frame: {e}");
                    continue;
                }
            };
            if let Err(e) = client
                .publish(&pub_topic, QoS::AtLeastOnce, false, payload)
                .await
            {
                error!("publish to '{pub_topic}' failed: {e}");
                break;
            }
        }
    }

    fn reap_tasks(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.event_loop_task.take() {
            task.abort();
        }
        if let Some(task) = self.publisher_task.take() {
            task.abort();
        }
    }
}

#[async_trait::async_trait]
impl Transport for BrokerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Broker
    }

    fn is_open(&self) -> bool {
        *self.state_rx.borrow() == LinkState::Connected
    }

    fn stub(&self) -> AgentStub {
        self.stub.clone()
    }

    async fn close(&mut self) -> SupervisorResult<()> {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.client.disconnect().await {
            warn!("broker disconnect request failed: {e}");
        }

        if let Some(task) = self.event_loop_task.take() {
            match tokio::time::timeout(Duration::from_secs(2), task).await {
                Ok(Ok(())) => debug!("broker event loop stopped"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("broker event loop ended with: {e}"),
                Err(_) => warn!("broker event loop did not stop in time"),
                _ => {}
            }
        }
        if let Some(task) = self.publisher_task.take() {
            task.abort();
        }
        info!("broker channel closed");
        Ok(())
    }
}

impl Drop for BrokerTransport {
    fn drop(&mut self) {
        // close() may never have been called; reap the background tasks
        self.reap_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_connection_resolves_on_connack() {
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(LinkState::Connected);
        });

        let result =
            BrokerTransport::wait_for_connection(state_rx, Duration::from_millis(200)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connection_times_out() {
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        // keep the sender alive so the channel does not close early
        let _keep = state_tx;

        let result =
            BrokerTransport::wait_for_connection(state_rx, Duration::from_millis(20)).await;
        assert!(matches!(
            result,
            Err(SupervisorError::ConnectTimeout { timeout_ms: 20 })
        ));
    }

    #[tokio::test]
    async fn test_wait_for_connection_fails_on_disconnect() {
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(LinkState::Disconnected("bad credentials".to_string()));
        });

        let result =
            BrokerTransport::wait_for_connection(state_rx, Duration::from_millis(200)).await;
        let error = result.unwrap_err();
        assert!(error.to_string().contains("bad credentials"));
    }

    #[test]
    fn test_configure_options_applies_credentials() {
        let params = BrokerParams {
            server: "broker.example.com".to_string(),
            port: 1883,
            client_id: "console-1".to_string(),
            username: Some("console".to_string()),
            password: None,
            token: None,
            pub_topic: "agent/command".to_string(),
            sub_topic: "agent/response".to_string(),
            lwt_topic: None,
            timeout: 10_000,
        };
        let credentials = Credentials {
            username: "console".to_string(),
            password: "secret".to_string(),
        };
        // construction must not panic with or without credentials
        let _ = configure_options(&params, Some(&credentials));
        let _ = configure_options(&params, None);
    }
}
