//! Mock collaborators for testing without external infrastructure
//!
//! `MockAgentServer` is an in-process TCP peer speaking the socket framing:
//! it answers the console's RPC requests, records what it was asked, and can
//! push event/log/stream frames to exercise the dispatch path end to end.

use crate::auth::Clock;
use crate::protocol::Frame;
use crate::supervisor::dispatch::{EventListener, LogListener};
use crate::supervisor::OutputSink;
use crate::protocol::{AgentEvent, AgentLogEntry};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Everything the mock agent recorded about the session
#[derive(Default)]
struct Recorded {
    stdin: Mutex<Vec<String>>,
    redirects: Mutex<Vec<i32>>,
}

/// In-process agent peer for socket transport tests
pub struct MockAgentServer {
    addr: SocketAddr,
    push_tx: mpsc::Sender<Frame>,
    recorded: Arc<Recorded>,
    disconnect_calls: Arc<AtomicUsize>,
    server_task: JoinHandle<()>,
}

impl MockAgentServer {
    /// Start a well-behaved agent
    pub async fn start() -> Self {
        Self::start_inner(false).await
    }

    /// Start an agent whose `disconnect` operation always fails, for
    /// teardown robustness tests
    pub async fn start_with_failing_disconnect() -> Self {
        Self::start_inner(true).await
    }

    async fn start_inner(fail_disconnect: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock agent");
        let addr = listener.local_addr().expect("local addr");
        let (push_tx, mut push_rx) = mpsc::channel::<Frame>(32);
        let recorded = Arc::new(Recorded::default());
        let disconnect_calls = Arc::new(AtomicUsize::new(0));

        let task_recorded = recorded.clone();
        let task_disconnects = disconnect_calls.clone();
        let server_task = tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();

            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        let Ok(Some(line)) = line else { break };
                        let Ok(frame) = serde_json::from_str::<Frame>(&line) else {
                            continue;
                        };
                        if let Frame::Request { id, method, params } = frame {
                            let response = Self::handle_request(
                                &method,
                                &params,
                                id,
                                fail_disconnect,
                                &task_recorded,
                                &task_disconnects,
                            );
                            if write_frame(&mut write_half, &response).await.is_err() {
                                break;
                            }
                        }
                    }
                    frame = push_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if write_frame(&mut write_half, &frame).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            addr,
            push_tx,
            recorded,
            disconnect_calls,
            server_task,
        }
    }

    fn handle_request(
        method: &str,
        params: &Value,
        id: Uuid,
        fail_disconnect: bool,
        recorded: &Recorded,
        disconnect_calls: &AtomicUsize,
    ) -> Frame {
        match method {
            "ping" => Frame::Response {
                id,
                result: Some(Value::Bool(true)),
                error: None,
            },
            "redirect" => {
                let shell = params
                    .get("shell")
                    .and_then(Value::as_i64)
                    .unwrap_or_default() as i32;
                recorded.redirects.lock().unwrap().push(shell);
                Frame::Response {
                    id,
                    result: Some(Value::Bool(true)),
                    error: None,
                }
            }
            "stdin" => {
                let text = params
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                recorded.stdin.lock().unwrap().push(text);
                Frame::Response {
                    id,
                    result: None,
                    error: None,
                }
            }
            "disconnect" => {
                disconnect_calls.fetch_add(1, Ordering::SeqCst);
                if fail_disconnect {
                    Frame::Response {
                        id,
                        result: None,
                        error: Some("disconnect refused by agent".to_string()),
                    }
                } else {
                    Frame::Response {
                        id,
                        result: None,
                        error: None,
                    }
                }
            }
            other => Frame::Response {
                id,
                result: None,
                error: Some(format!("unknown method '{other}'")),
            },
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Push a frame to the connected console
    pub async fn push(&self, frame: Frame) {
        self.push_tx.send(frame).await.expect("push to console");
    }

    /// Convenience: push a framework event
    pub async fn push_event(&self, topic: &str) {
        self.push(Frame::Event {
            event: AgentEvent {
                topic: topic.to_string(),
                properties: Default::default(),
                received_at: Utc::now(),
            },
        })
        .await;
    }

    pub fn stdin_seen(&self) -> Vec<String> {
        self.recorded.stdin.lock().unwrap().clone()
    }

    pub fn redirects_seen(&self) -> Vec<i32> {
        self.recorded.redirects.lock().unwrap().clone()
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }
}

impl Drop for MockAgentServer {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}

async fn write_frame(write_half: &mut OwnedWriteHalf, frame: &Frame) -> std::io::Result<()> {
    let mut line = serde_json::to_string(frame).expect("serializable frame");
    line.push('\n');
    write_half.write_all(line.as_bytes()).await
}

/// Event listener recording every delivery
pub struct RecordingEventListener {
    topics: Vec<String>,
    seen: Mutex<Vec<AgentEvent>>,
}

impl RecordingEventListener {
    pub fn new(topics: &[&str]) -> Self {
        Self {
            topics: topics.iter().map(|t| t.to_string()).collect(),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<AgentEvent> {
        self.seen.lock().unwrap().clone()
    }
}

impl EventListener for RecordingEventListener {
    fn topics(&self) -> Vec<String> {
        self.topics.clone()
    }

    fn on_event(&self, event: &AgentEvent) {
        self.seen.lock().unwrap().push(event.clone());
    }
}

/// Log listener recording every delivery
#[derive(Default)]
pub struct RecordingLogListener {
    seen: Mutex<Vec<AgentLogEntry>>,
}

impl RecordingLogListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self) -> Vec<AgentLogEntry> {
        self.seen.lock().unwrap().clone()
    }
}

impl LogListener for RecordingLogListener {
    fn logged(&self, entry: &AgentLogEntry) {
        self.seen.lock().unwrap().push(entry.clone());
    }
}

/// Output sink accumulating into a shared string
#[derive(Default)]
pub struct SharedBuffer {
    content: Mutex<String>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.content.lock().unwrap().clone()
    }
}

impl OutputSink for SharedBuffer {
    fn append(&self, text: &str) {
        self.content.lock().unwrap().push_str(text);
    }
}

/// Settable clock for token cache tests
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        let mut now = self.now.lock().unwrap();
        *now += ChronoDuration::seconds(secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
