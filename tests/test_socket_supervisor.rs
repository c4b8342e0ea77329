//! End-to-end tests of the supervisor over the socket transport, driven
//! against an in-process mock agent

use agentport::config::SocketParams;
use agentport::error::SupervisorError;
use agentport::protocol::{
    AgentLogEntry, Frame, LogLevel, AGENT_CONNECTED_TOPIC, AGENT_DISCONNECTED_TOPIC,
};
use agentport::supervisor::{EventListener, RpcSupervisor};
use agentport::testing::mocks::{
    MockAgentServer, RecordingEventListener, RecordingLogListener, SharedBuffer,
};
use chrono::Utc;
use std::sync::Arc;
use tokio_test::assert_ok;
use std::time::{Duration, Instant};

/// Poll until the condition holds or the deadline passes
async fn wait_for<F: Fn() -> bool>(condition: F, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn params_for(server: &MockAgentServer) -> SocketParams {
    SocketParams::new("127.0.0.1", server.port(), 1000)
}

#[tokio::test]
async fn test_connect_refused_port_fails_within_budget() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let supervisor = RpcSupervisor::new();
    let params = SocketParams::new("127.0.0.1", port, 500);

    let started = Instant::now();
    let result = supervisor.connect_socket(&params).await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(SupervisorError::Connect { .. })));
    assert!(
        elapsed < Duration::from_millis(2000),
        "must not hang, took {elapsed:?}"
    );
    assert!(!supervisor.is_open().await);
}

#[tokio::test]
async fn test_connect_ping_disconnect_round_trip() {
    let server = MockAgentServer::start().await;
    let supervisor = RpcSupervisor::new();

    assert_ok!(supervisor.connect_socket(&params_for(&server)).await);
    assert!(supervisor.is_open().await);

    let agent = supervisor.agent().await.unwrap();
    assert!(agent.ping().await.unwrap());

    supervisor.disconnect().await.unwrap();
    assert!(!supervisor.is_open().await);
    assert!(matches!(
        supervisor.agent().await,
        Err(SupervisorError::NotConnected)
    ));
    assert_eq!(server.disconnect_calls(), 1);
}

#[tokio::test]
async fn test_connected_lifecycle_event_fires() {
    let server = MockAgentServer::start().await;
    let supervisor = RpcSupervisor::new();

    let listener = Arc::new(RecordingEventListener::new(&["fx/console/agent/*"]));
    supervisor.add_event_listener(listener.clone());

    supervisor.connect_socket(&params_for(&server)).await.unwrap();

    let seen = listener.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].topic, AGENT_CONNECTED_TOPIC);

    supervisor.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_second_connect_while_open_is_refused() {
    let server = MockAgentServer::start().await;
    let supervisor = RpcSupervisor::new();
    supervisor.connect_socket(&params_for(&server)).await.unwrap();

    let result = supervisor.connect_socket(&params_for(&server)).await;
    assert!(matches!(result, Err(SupervisorError::AlreadyConnected)));
    // the existing session survives the refused attempt
    assert!(supervisor.is_open().await);
    assert!(supervisor.agent().await.unwrap().ping().await.unwrap());

    supervisor.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_event_fanout_matches_topics() {
    let server = MockAgentServer::start().await;
    let supervisor = RpcSupervisor::new();

    let bundles = Arc::new(RecordingEventListener::new(&["bundle/*"]));
    let everything = Arc::new(RecordingEventListener::new(&["*"]));
    supervisor.add_event_listener(bundles.clone());
    supervisor.add_event_listener(everything.clone());

    supervisor.connect_socket(&params_for(&server)).await.unwrap();

    server.push_event("bundle/INSTALLED").await;
    server.push_event("service/REGISTERED").await;

    wait_for(|| everything.seen().len() >= 3, "all events delivered").await;

    let bundle_topics: Vec<_> = bundles.seen().iter().map(|e| e.topic.clone()).collect();
    assert_eq!(bundle_topics, vec!["bundle/INSTALLED"]);

    // the wildcard listener saw connect, then both pushes, in arrival order
    let all_topics: Vec<_> = everything.seen().iter().map(|e| e.topic.clone()).collect();
    assert_eq!(
        all_topics,
        vec![AGENT_CONNECTED_TOPIC, "bundle/INSTALLED", "service/REGISTERED"]
    );

    supervisor.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_listener_added_twice_delivers_once() {
    let server = MockAgentServer::start().await;
    let supervisor = RpcSupervisor::new();

    let listener = Arc::new(RecordingEventListener::new(&["bundle/*"]));
    let as_dyn: Arc<dyn EventListener> = listener.clone();
    supervisor.add_event_listener(as_dyn.clone());
    supervisor.add_event_listener(as_dyn);

    supervisor.connect_socket(&params_for(&server)).await.unwrap();
    server.push_event("bundle/INSTALLED").await;

    wait_for(|| !listener.seen().is_empty(), "event delivery").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(listener.seen().len(), 1);

    supervisor.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_log_records_fan_out_to_all_log_listeners() {
    let server = MockAgentServer::start().await;
    let supervisor = RpcSupervisor::new();

    let first = Arc::new(RecordingLogListener::new());
    let second = Arc::new(RecordingLogListener::new());
    supervisor.add_log_listener(first.clone());
    supervisor.add_log_listener(second.clone());

    supervisor.connect_socket(&params_for(&server)).await.unwrap();

    server
        .push(Frame::Log {
            entry: AgentLogEntry {
                level: LogLevel::Warn,
                message: "bundle refresh pending".to_string(),
                logger: Some("framework".to_string()),
                logged_at: Utc::now(),
                exception: None,
            },
        })
        .await;

    wait_for(|| !first.seen().is_empty(), "log delivery").await;
    assert_eq!(first.seen()[0].message, "bundle refresh pending");
    assert_eq!(second.seen().len(), 1);

    supervisor.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_set_streams_redirects_and_receives_output() {
    let server = MockAgentServer::start().await;
    let supervisor = RpcSupervisor::new();
    supervisor.set_shell(0);
    supervisor.connect_socket(&params_for(&server)).await.unwrap();

    let out = Arc::new(SharedBuffer::new());
    let err = Arc::new(SharedBuffer::new());
    supervisor
        .set_streams(out.clone(), err.clone())
        .await
        .unwrap();

    assert_eq!(server.redirects_seen(), vec![0]);

    server
        .push(Frame::Stdout {
            text: "g! ".to_string(),
        })
        .await;
    server
        .push(Frame::Stderr {
            text: "oops\n".to_string(),
        })
        .await;

    wait_for(|| out.contents() == "g! ", "stdout delivery").await;
    wait_for(|| err.contents() == "oops\n", "stderr delivery").await;

    supervisor.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_stdin_pump_forwards_chunks_until_eof() {
    let server = MockAgentServer::start().await;
    let supervisor = RpcSupervisor::new();
    supervisor.connect_socket(&params_for(&server)).await.unwrap();

    let (mut writer, reader) = tokio::io::duplex(64);
    supervisor.set_stdin(reader).await.unwrap();

    use tokio::io::AsyncWriteExt;
    writer.write_all(b"lb\n").await.unwrap();
    wait_for(|| !server.stdin_seen().is_empty(), "stdin forwarding").await;
    assert_eq!(server.stdin_seen(), vec!["lb\n".to_string()]);

    // EOF ends the pump without tearing down the session
    drop(writer);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(supervisor.is_open().await);

    supervisor.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_clears_state_even_when_remote_call_fails() {
    let server = MockAgentServer::start_with_failing_disconnect().await;
    let supervisor = RpcSupervisor::new();
    supervisor.connect_socket(&params_for(&server)).await.unwrap();

    // the remote disconnect RPC errors; teardown must still succeed
    supervisor.disconnect().await.unwrap();

    assert!(!supervisor.is_open().await);
    assert!(matches!(
        supervisor.agent().await,
        Err(SupervisorError::NotConnected)
    ));
    assert_eq!(server.disconnect_calls(), 1);
}

#[tokio::test]
async fn test_peer_loss_dispatches_disconnected_event() {
    let server = MockAgentServer::start().await;
    let supervisor = RpcSupervisor::new();

    let listener = Arc::new(RecordingEventListener::new(&["fx/console/agent/*"]));
    supervisor.add_event_listener(listener.clone());
    supervisor.connect_socket(&params_for(&server)).await.unwrap();

    // killing the mock agent closes the socket from the far side
    drop(server);

    wait_for(
        || {
            listener
                .seen()
                .iter()
                .any(|e| e.topic == AGENT_DISCONNECTED_TOPIC)
        },
        "disconnected lifecycle event",
    )
    .await;
    assert!(!supervisor.is_open().await);
}
