//! In-process editors, proxies and agents for conductor tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use symposium_conductor::{
    ByteStreams, ChainDescriptor, Conductor, ConductorError, Message, TransparentProxy,
};
use tokio::io::{
    AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf,
};
use tokio::task::JoinHandle;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Initialize tracing for tests. Set RUST_LOG to see output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::DEBUG.into()),
        )
        .with_test_writer()
        .with_ansi(false)
        .try_init();
}

/// A duplex link: the conductor's end as a component, plus the far end.
pub fn link(label: &str) -> (ByteStreams, DuplexStream) {
    let (conductor_end, far_end) = tokio::io::duplex(64 * 1024);
    let (read, write) = tokio::io::split(conductor_end);
    (ByteStreams::new(write, read).named(label), far_end)
}

/// Newline-delimited JSON over one end of a duplex link.
pub struct TestPeer {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl TestPeer {
    pub fn new(stream: DuplexStream) -> Self {
        let (read, writer) = tokio::io::split(stream);
        TestPeer {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    pub async fn send(&mut self, value: Value) {
        let line = format!("{value}\n");
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    pub async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for a message")
            .expect("read failed")
            .expect("link closed");
        serde_json::from_str(&line).unwrap()
    }

    /// Send a request and wait for the response with the same id.
    pub async fn request(&mut self, id: i64, method: &str, params: Value) -> Value {
        self.send(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await;
        let response = self.recv().await;
        assert_eq!(response["id"], json!(id), "unexpected message: {response}");
        response
    }

    /// True once the other side has hung up.
    pub async fn closed(&mut self) -> bool {
        matches!(
            tokio::time::timeout(TIMEOUT, self.lines.next_line()).await,
            Ok(Ok(None)) | Ok(Err(_))
        )
    }
}

/// Run a conductor over `descriptor` with an in-process editor.
pub fn run_conductor(
    conductor: impl FnOnce(ChainDescriptor) -> Conductor,
    descriptor: ChainDescriptor,
) -> (TestPeer, JoinHandle<Result<(), ConductorError>>) {
    let (editor_component, editor_end) = link("editor");
    let conductor = conductor(descriptor);
    let handle = tokio::spawn(conductor.run(editor_component));
    (TestPeer::new(editor_end), handle)
}

pub fn conductor(descriptor: ChainDescriptor) -> Conductor {
    Conductor::new("test-conductor", descriptor)
}

pub async fn initialize(editor: &mut TestPeer) -> Value {
    let response = editor
        .request(0, "initialize", json!({"protocolVersion": 1, "clientCapabilities": {}}))
        .await;
    response["result"].clone()
}

pub async fn new_session(editor: &mut TestPeer, id: i64) -> String {
    let response = editor
        .request(id, "session/new", json!({"cwd": "/work", "mcpServers": []}))
        .await;
    response["result"]["sessionId"].as_str().unwrap().to_string()
}

pub fn prompt(session_id: &str, text: &str) -> Value {
    json!({"sessionId": session_id, "prompt": [{"type": "text", "text": text}]})
}

// ====
// Proxies
// ====

/// What a scripted proxy does with one message from the conductor.
pub enum Step {
    /// Behave transparently.
    Pass(Message),
    /// Send these messages instead.
    Reply(Vec<Message>),
    /// Drop the message.
    Swallow,
    /// Hang up.
    Crash,
}

/// A proxy that consults `hook` for every message before passing it through.
pub fn scripted_proxy(
    label: &str,
    mut proxy: TransparentProxy,
    mut hook: impl FnMut(Message) -> Step + Send + 'static,
) -> ByteStreams {
    let (component, stream) = link(label);
    tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(stream);
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(message) = Message::parse(&line) else {
                continue;
            };
            let replies = match hook(message) {
                Step::Pass(message) => proxy.pass_through(message).into_iter().collect(),
                Step::Reply(messages) => messages,
                Step::Swallow => Vec::new(),
                Step::Crash => return,
            };
            for reply in replies {
                let line = format!("{}\n", reply.to_line());
                if write.write_all(line.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    });
    component
}

pub fn transparent_proxy(label: &str) -> ByteStreams {
    scripted_proxy(label, TransparentProxy::new(), Step::Pass)
}

// ====
// Agent
// ====

#[derive(Clone)]
pub struct AgentConfig {
    pub initialize_result: Value,
    pub answer_initialize: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            initialize_result: json!({
                "protocolVersion": 1,
                "agentCapabilities": {
                    "loadSession": true,
                    "promptCapabilities": {"image": true}
                }
            }),
            answer_initialize: true,
        }
    }
}

/// Everything the mock agent received, in order.
#[derive(Clone, Default)]
pub struct AgentLog(Arc<Mutex<Vec<Value>>>);

impl AgentLog {
    pub fn messages(&self) -> Vec<Value> {
        self.0.lock().unwrap().clone()
    }

    /// Every received message with `method`.
    pub fn with_method(&self, method: &str) -> Vec<Value> {
        self.messages()
            .into_iter()
            .filter(|message| message["method"] == method)
            .collect()
    }

    pub fn methods(&self) -> Vec<String> {
        self.messages()
            .iter()
            .filter_map(|message| message["method"].as_str().map(str::to_string))
            .collect()
    }
}

/// Id the mock agent uses for its permission request.
pub const PERMISSION_REQUEST_ID: i64 = 1000;

/// A small ACP agent.
///
/// Prompts are answered with one `session/update` followed by the
/// response, except: `"hold"` waits for `session/cancel`, and `"ask"`
/// first asks the client for permission.
pub fn mock_agent(config: AgentConfig) -> (ByteStreams, AgentLog) {
    let (component, stream) = link("agent");
    let log = AgentLog::default();
    let agent_log = log.clone();
    tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(stream);
        let mut lines = BufReader::new(read).lines();
        let mut sessions = 0;
        let mut held: Vec<(Value, String)> = Vec::new();
        let mut awaiting_permission: Option<Value> = None;

        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(message) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            agent_log.0.lock().unwrap().push(message.clone());

            let id = message.get("id").cloned();
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            let session_id = params["sessionId"].as_str().unwrap_or_default().to_string();
            let mut out = Vec::new();

            match (message["method"].as_str(), id) {
                (Some("initialize"), Some(id)) => {
                    if config.answer_initialize {
                        out.push(result(id, config.initialize_result.clone()));
                    }
                }
                (Some("session/new"), Some(id)) => {
                    sessions += 1;
                    out.push(result(id, json!({"sessionId": format!("session-{sessions}")})));
                }
                (Some("session/prompt"), Some(id)) => {
                    let text = params["prompt"][0]["text"].as_str().unwrap_or_default().to_string();
                    out.push(json!({
                        "jsonrpc": "2.0",
                        "method": "session/update",
                        "params": {
                            "sessionId": session_id,
                            "update": {
                                "sessionUpdate": "agent_message_chunk",
                                "content": {"type": "text", "text": format!("echo: {text}")}
                            }
                        }
                    }));
                    match text.as_str() {
                        "hold" => held.push((id, session_id)),
                        "ask" => {
                            out.push(json!({
                                "jsonrpc": "2.0",
                                "id": PERMISSION_REQUEST_ID,
                                "method": "session/request_permission",
                                "params": {"sessionId": session_id, "toolCall": {"toolCallId": "call-1"}, "options": []}
                            }));
                            awaiting_permission = Some(id);
                        }
                        _ => out.push(result(id, json!({"stopReason": "end_turn"}))),
                    }
                }
                (Some("ping"), Some(id)) => out.push(result(id, json!({"pong": true}))),
                (Some("stray"), Some(id)) => {
                    out.push(result(json!(999_999), json!({})));
                    out.push(result(id, json!({"ok": true})));
                }
                (Some("session/cancel"), None) => {
                    let (cancelled, kept): (Vec<_>, Vec<_>) =
                        held.drain(..).partition(|(_, held_session)| *held_session == session_id);
                    held = kept;
                    for (id, _) in cancelled {
                        out.push(result(id, json!({"stopReason": "cancelled"})));
                    }
                }
                (Some(_), Some(id)) => out.push(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": "method not found"}
                })),
                (None, Some(id)) if id == json!(PERMISSION_REQUEST_ID) => {
                    if let Some(prompt_id) = awaiting_permission.take() {
                        out.push(result(prompt_id, json!({"stopReason": "end_turn"})));
                    }
                }
                _ => {}
            }

            for value in out {
                let line = format!("{value}\n");
                if write.write_all(line.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    });
    (component, log)
}

fn result(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}
