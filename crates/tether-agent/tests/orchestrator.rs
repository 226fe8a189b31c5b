// End-to-end orchestrator scenarios against a scripted provider: turn
// splitting, deferred tool pairing, pending-tool notices, keep-alive
// exclusion, permission denial, and mid-stream cancellation.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use tether_agent::events;
use tether_agent::gate::PermissionGate;
use tether_agent::orchestrator::{Orchestrator, OrchestratorConfig};
use tether_agent::provider::{ChatProvider, ChatRequest, ProviderError};
use tether_agent::sse::{Delta, SseEvent, StartedBlock, Usage};
use tether_agent::tools::{Tool, ToolOutput};
use tether_core::{
    ContentBlock, Message, Role, GENERATION_STOPPED_MARKER, KEEP_ALIVE_PROMPT, TOOL_CALLED_TEXT,
};
use tether_store::MessageStore;

// ---------------------------------------------------------------------
// Scripted provider
// ---------------------------------------------------------------------

enum Script {
    /// Send the events, then end the stream.
    Events(Vec<SseEvent>),
    /// Send the events, signal `started`, then hold the stream open until
    /// the caller cancels.
    HoldUntilCancel {
        events: Vec<SseEvent>,
        started: Arc<Notify>,
    },
}

struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn request(&self, index: usize) -> ChatRequest {
        self.requests.lock().unwrap()[index].clone()
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<SseEvent>,
        cancel: CancellationToken,
    ) -> Result<(), ProviderError> {
        self.requests.lock().unwrap().push(req.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("provider script exhausted");
        match script {
            Script::Events(events) => {
                for event in events {
                    let _ = tx.send(event).await;
                }
                Ok(())
            }
            Script::HoldUntilCancel { events, started } => {
                for event in events {
                    let _ = tx.send(event).await;
                }
                started.notify_one();
                cancel.cancelled().await;
                Ok(())
            }
        }
    }
}

fn text_turn(body: &str) -> Script {
    Script::Events(vec![
        SseEvent::MessageStart {
            model: "claude-sonnet-4-6".to_string(),
            usage: Usage {
                input_tokens: 7,
                output_tokens: 0,
            },
        },
        SseEvent::ContentBlockStart {
            index: 0,
            block: StartedBlock::Text,
        },
        SseEvent::ContentBlockDelta {
            index: 0,
            delta: Delta::Text(body.to_string()),
        },
        SseEvent::ContentBlockStop { index: 0 },
        SseEvent::MessageDelta {
            stop_reason: Some("end_turn".to_string()),
            usage: Some(Usage {
                input_tokens: 0,
                output_tokens: 3,
            }),
        },
        SseEvent::MessageStop,
    ])
}

fn tool_turn(text: &str, calls: &[(&str, &str)]) -> Script {
    let mut events = vec![
        SseEvent::ContentBlockStart {
            index: 0,
            block: StartedBlock::Text,
        },
        SseEvent::ContentBlockDelta {
            index: 0,
            delta: Delta::Text(text.to_string()),
        },
        SseEvent::ContentBlockStop { index: 0 },
    ];
    for (i, (id, name)) in calls.iter().enumerate() {
        let index = i + 1;
        events.push(SseEvent::ContentBlockStart {
            index,
            block: StartedBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
            },
        });
        events.push(SseEvent::ContentBlockDelta {
            index,
            delta: Delta::InputJson("{\"sample_data\":\"x\"}".to_string()),
        });
        events.push(SseEvent::ContentBlockStop { index });
    }
    events.push(SseEvent::MessageDelta {
        stop_reason: Some("tool_use".to_string()),
        usage: None,
    });
    events.push(SseEvent::MessageStop);
    Script::Events(events)
}

// ---------------------------------------------------------------------
// Gated tool: waits for a release signal before returning its result.
// ---------------------------------------------------------------------

struct GatedTool {
    name: String,
    release: Arc<Notify>,
}

impl GatedTool {
    fn new(name: &str) -> (Arc<Self>, Arc<Notify>) {
        let release = Arc::new(Notify::new());
        (
            Arc::new(Self {
                name: name.to_string(),
                release: release.clone(),
            }),
            release,
        )
    }
}

#[async_trait]
impl Tool for GatedTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "test tool held open until released"
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }
    async fn execute(&self, _input: serde_json::Value) -> ToolOutput {
        self.release.notified().await;
        ToolOutput::success([format!("{} finished", self.name)])
    }
}

// ---------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------

fn config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::new("claude-sonnet-4-6");
    // Long enough that no ping fires during a test on its own.
    config.keep_alive_interval = Duration::from_secs(600);
    config
}

fn spawn_orchestrator(
    provider: Arc<ScriptedProvider>,
    tools: Vec<Arc<dyn Tool>>,
    gate: PermissionGate,
    store: Option<Arc<MessageStore>>,
) -> (Arc<Orchestrator>, events::BusReceiver) {
    let (bus, bus_rx) = events::channel();
    let orchestrator = Orchestrator::spawn(provider, tools, gate, config(), store, bus);
    (orchestrator, bus_rx)
}

fn allow_all(names: &[&str]) -> PermissionGate {
    PermissionGate::allow_all(names.iter().copied())
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 4s");
}

fn roles(history: &[Message]) -> Vec<Role> {
    history.iter().map(|m| m.role).collect()
}

// ---------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------

#[tokio::test]
async fn simple_round_trip() {
    let provider = ScriptedProvider::new(vec![text_turn("hello")]);
    let (orchestrator, _bus) =
        spawn_orchestrator(provider.clone(), Vec::new(), allow_all(&[]), None);

    orchestrator.send_user("hi", true, true).await.unwrap();

    let history = orchestrator.history_snapshot();
    assert_eq!(roles(&history), vec![Role::User, Role::Assistant]);
    assert_eq!(history[0].first_text(), Some("hi"));
    assert_eq!(history[1].first_text(), Some("hello"));
    assert!(orchestrator.pending_tool_names().is_empty());
    // Keep-alive timer is armed after the first send.
    assert_eq!(
        orchestrator.keep_alive_timer().phase().unwrap(),
        tether_timer::TimerPhase::Running
    );
    orchestrator.shutdown();
}

#[tokio::test]
async fn tool_call_with_deferred_result() {
    let (tool, release) = GatedTool::new("demo");
    let provider = ScriptedProvider::new(vec![
        tool_turn("working on it", &[("t1", "demo")]),
        text_turn("all done"),
    ]);
    let (orchestrator, _bus) = spawn_orchestrator(
        provider.clone(),
        vec![tool as Arc<dyn Tool>],
        allow_all(&["demo"]),
        None,
    );

    orchestrator.send_user("run demo", true, true).await.unwrap();

    // Stream ended: text portion committed, tool use parked in the buffer.
    let history = orchestrator.history_snapshot();
    assert_eq!(roles(&history), vec![Role::User, Role::Assistant]);
    assert_eq!(history[1].first_text(), Some("working on it"));
    assert_eq!(orchestrator.pending_tool_names(), vec!["demo"]);

    // Handler completes; the pair flushes and the result round-trips.
    release.notify_one();
    let orch = orchestrator.clone();
    wait_until(move || orch.history_snapshot().len() == 5).await;

    let history = orchestrator.history_snapshot();
    assert_eq!(
        roles(&history),
        vec![
            Role::User,
            Role::Assistant,
            Role::Assistant,
            Role::User,
            Role::Assistant
        ]
    );
    // Buffered tool-use message committed ahead of its result.
    assert_eq!(history[2].tool_use_ids(), vec!["t1"]);
    assert_eq!(history[2].first_text(), Some(TOOL_CALLED_TEXT));
    assert_eq!(history[3].tool_result_ids(), vec!["t1"]);
    assert_eq!(history[4].first_text(), Some("all done"));
    assert!(orchestrator.pending_tool_names().is_empty());

    // The follow-up request carried the tool_result back to the model.
    assert_eq!(provider.request_count(), 2);
    let second = provider.request(1);
    let last = second.messages.last().unwrap();
    assert_eq!(last.role, Role::User);
    assert_eq!(last.tool_result_ids(), vec!["t1"]);
    orchestrator.shutdown();
}

#[tokio::test]
async fn concurrent_tools_complete_out_of_order() {
    let (alpha, release_a) = GatedTool::new("alpha");
    let (beta, release_b) = GatedTool::new("beta");
    let provider = ScriptedProvider::new(vec![
        tool_turn("two calls", &[("a", "alpha"), ("b", "beta")]),
        text_turn("ack b"),
        text_turn("ack a"),
    ]);
    let (orchestrator, _bus) = spawn_orchestrator(
        provider.clone(),
        vec![alpha as Arc<dyn Tool>, beta as Arc<dyn Tool>],
        allow_all(&["alpha", "beta"]),
        None,
    );

    orchestrator.send_user("go", true, true).await.unwrap();
    let mut pending = orchestrator.pending_tool_names();
    pending.sort();
    assert_eq!(pending, vec!["alpha", "beta"]);

    // b completes first: only the b pair is flushed and sent.
    release_b.notify_one();
    let orch = orchestrator.clone();
    wait_until(move || orch.history_snapshot().len() == 5).await;
    assert_eq!(orchestrator.pending_tool_names(), vec!["alpha"]);
    {
        let history = orchestrator.history_snapshot();
        assert_eq!(history[2].tool_use_ids(), vec!["b"]);
        assert_eq!(history[3].tool_result_ids(), vec!["b"]);
        assert_eq!(history[4].first_text(), Some("ack b"));
    }

    // a later: its pair flushes on its own.
    release_a.notify_one();
    let orch = orchestrator.clone();
    wait_until(move || orch.history_snapshot().len() == 8).await;
    let history = orchestrator.history_snapshot();
    assert_eq!(history[5].tool_use_ids(), vec!["a"]);
    assert_eq!(history[6].tool_result_ids(), vec!["a"]);
    assert_eq!(history[7].first_text(), Some("ack a"));
    assert!(orchestrator.pending_tool_names().is_empty());
    orchestrator.shutdown();
}

#[tokio::test]
async fn pending_tool_notice_prepended() {
    let (tool, _release) = GatedTool::new("demo");
    let provider = ScriptedProvider::new(vec![
        tool_turn("working", &[("t1", "demo")]),
        text_turn("second reply"),
    ]);
    let (orchestrator, _bus) = spawn_orchestrator(
        provider.clone(),
        vec![tool as Arc<dyn Tool>],
        allow_all(&["demo"]),
        None,
    );

    orchestrator.send_user("first", true, true).await.unwrap();
    orchestrator.send_user("second", true, true).await.unwrap();

    let second = provider.request(1);
    let last = second.messages.last().unwrap();
    assert_eq!(
        last.first_text(),
        Some("[NOTE: Tool(s) 'demo' are still processing.]\n\nsecond")
    );
    orchestrator.shutdown();
}

#[tokio::test]
async fn keep_alive_turns_skip_the_store() {
    let store = Arc::new(MessageStore::new(rusqlite::Connection::open_in_memory().unwrap()).unwrap());
    let provider = ScriptedProvider::new(vec![text_turn("hello"), text_turn("ping ack")]);
    let (orchestrator, _bus) = spawn_orchestrator(
        provider.clone(),
        Vec::new(),
        allow_all(&[]),
        Some(store.clone()),
    );

    orchestrator.send_user("hi", true, true).await.unwrap();
    orchestrator.send_keep_alive().await.unwrap();

    // The ping went out bit-exact...
    let ping_request = provider.request(1);
    assert_eq!(
        ping_request.messages.last().unwrap().first_text(),
        Some(KEEP_ALIVE_PROMPT)
    );
    // ...but neither ping nor ack was persisted.
    let rows = store.load_recent(10, None).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].first_text(), Some("hi"));
    assert_eq!(rows[1].first_text(), Some("hello"));

    // The in-memory history still carries the full exchange.
    assert_eq!(orchestrator.history_snapshot().len(), 4);
    orchestrator.shutdown();
}

#[tokio::test]
async fn timer_completion_fires_keep_alive_ping() {
    let store = Arc::new(MessageStore::new(rusqlite::Connection::open_in_memory().unwrap()).unwrap());
    let provider = ScriptedProvider::new(vec![text_turn("hello"), text_turn("ping ack")]);
    let (bus, _bus_rx) = events::channel();
    let mut config = config();
    config.keep_alive_interval = Duration::from_millis(400);
    let orchestrator = Orchestrator::spawn(
        provider.clone(),
        Vec::new(),
        allow_all(&[]),
        config,
        Some(store.clone()),
        bus,
    );

    // The timer arms on the first user send; its completion pings.
    orchestrator.send_user("hi", true, true).await.unwrap();
    let probe = provider.clone();
    wait_until(move || probe.request_count() >= 2).await;
    orchestrator.shutdown();

    let ping_request = provider.request(1);
    assert_eq!(
        ping_request.messages.last().unwrap().first_text(),
        Some(KEEP_ALIVE_PROMPT)
    );
    // Neither the ping nor its reply was persisted.
    assert_eq!(store.load_recent(10, None).unwrap().len(), 2);
}

#[tokio::test]
async fn denied_tool_produces_synthetic_error_result() {
    let provider = ScriptedProvider::new(vec![
        tool_turn("trying", &[("t1", "forbidden")]),
        text_turn("understood"),
    ]);
    // No rule for "forbidden": unknown tools are denied.
    let (orchestrator, _bus) = spawn_orchestrator(
        provider.clone(),
        Vec::new(),
        PermissionGate::new(Default::default()),
        None,
    );

    orchestrator.send_user("go", true, true).await.unwrap();

    let orch = orchestrator.clone();
    wait_until(move || orch.history_snapshot().len() == 5).await;
    let history = orchestrator.history_snapshot();
    assert_eq!(history[3].tool_result_ids(), vec!["t1"]);

    let ContentBlock::ToolResult {
        content, is_error, ..
    } = &history[3].content[1]
    else {
        panic!("expected tool result block");
    };
    assert!(*is_error);
    let body = content[0].as_text().unwrap();
    assert!(body.contains("Tool 'forbidden' is not allowed in the current context"));
    assert!(body.contains("Do NOT proceed!"));
    orchestrator.shutdown();
}

#[tokio::test]
async fn cancellation_mid_stream_commits_partial_turn_once() {
    let started = Arc::new(Notify::new());
    let provider = ScriptedProvider::new(vec![Script::HoldUntilCancel {
        events: vec![
            SseEvent::MessageStart {
                model: "claude-sonnet-4-6".to_string(),
                usage: Usage::default(),
            },
            SseEvent::ContentBlockStart {
                index: 0,
                block: StartedBlock::Text,
            },
            SseEvent::ContentBlockDelta {
                index: 0,
                delta: Delta::Text("partial answer".to_string()),
            },
        ],
        started: started.clone(),
    }]);
    let (orchestrator, mut bus) =
        spawn_orchestrator(provider.clone(), Vec::new(), allow_all(&[]), None);

    let sender = orchestrator.clone();
    let send_task =
        tokio::spawn(async move { sender.send_user("long question", true, true).await });

    started.notified().await;
    orchestrator.request_stop();
    send_task.await.unwrap().unwrap();

    let history = orchestrator.history_snapshot();
    assert_eq!(roles(&history), vec![Role::User, Role::Assistant]);
    assert_eq!(
        history[1].first_text(),
        Some(format!("partial answer{GENERATION_STOPPED_MARKER}").as_str())
    );

    let mut cancelled_events = 0;
    while let Ok(event) = bus.try_recv() {
        if event == tether_agent::BusEvent::Cancelled {
            cancelled_events += 1;
        }
    }
    assert_eq!(cancelled_events, 1);
    orchestrator.shutdown();
}

#[tokio::test]
async fn load_history_normalizes_persisted_mess() {
    let provider = ScriptedProvider::new(vec![]);
    let (orchestrator, _bus) =
        spawn_orchestrator(provider, Vec::new(), allow_all(&[]), None);

    let persisted = vec![
        Message::user_text("q1"),
        Message::user_text("q2"),
        Message::assistant_text("a1"),
        Message::assistant_text("a2"),
    ];
    let count = orchestrator.load_history(persisted, None, 50, true);
    assert_eq!(count, 4);

    let history = orchestrator.history_snapshot();
    assert_eq!(
        roles(&history),
        vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
    );
    assert!(history[1].is_placeholder());
    orchestrator.shutdown();
}

#[tokio::test]
async fn load_history_can_strip_tool_blocks() {
    let provider = ScriptedProvider::new(vec![]);
    let (orchestrator, _bus) =
        spawn_orchestrator(provider, Vec::new(), allow_all(&[]), None);

    let persisted = vec![
        Message::user_text("run"),
        Message::new(
            Role::Assistant,
            vec![
                ContentBlock::text("calling"),
                ContentBlock::tool_use("t1", "demo", serde_json::json!({})),
            ],
        ),
        Message::new(
            Role::User,
            vec![ContentBlock::tool_result(
                "t1",
                vec![ContentBlock::text("out")],
                false,
            )],
        ),
        Message::assistant_text("done"),
    ];
    orchestrator.load_history(persisted, None, 50, false);

    for msg in orchestrator.history_snapshot() {
        assert!(msg.tool_use_ids().is_empty());
        assert!(msg.tool_result_ids().is_empty());
    }
    orchestrator.shutdown();
}
