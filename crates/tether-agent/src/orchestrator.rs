use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_buffer::{ExpiredUse, ToolPair, ToolPairBuffer};
use tether_core::{
    pending_tool_notice, permission_denied_payload, ContentBlock, Message, Role, TetherConfig,
    TetherError, KEEP_ALIVE_PROMPT, TOOL_CALLED_TEXT,
};
use tether_store::MessageStore;
use tether_timer::{KeepAliveTimer, TimerEvent};

use crate::assembler::{AssistantTurn, TurnAssembler};
use crate::builder;
use crate::events::{BusEvent, BusSender};
use crate::gate::PermissionGate;
use crate::provider::{ChatProvider, RequestParams, ToolChoice};
use crate::sse::SseEvent;
use crate::tools::{to_definitions, Tool, ToolOutput};

/// Value configuration for one orchestrator. Loaded once and passed in;
/// the orchestrator holds no ambient settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub model: String,
    pub system: Vec<ContentBlock>,
    pub keep_alive_interval: Duration,
    pub pair_timeout: Duration,
    pub tool_use_enabled: bool,
    pub use_thinking: bool,
    pub use_cache: bool,
    pub cache_tools: bool,
    pub cache_system: bool,
    pub cache_messages: bool,
}

impl OrchestratorConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: Vec::new(),
            keep_alive_interval: Duration::from_secs(4 * 60),
            pair_timeout: Duration::from_secs(5 * 60),
            tool_use_enabled: true,
            use_thinking: false,
            use_cache: true,
            cache_tools: true,
            cache_system: true,
            cache_messages: true,
        }
    }

    pub fn from_settings(settings: &TetherConfig, system: Vec<ContentBlock>) -> Self {
        Self {
            model: settings.api.model.clone(),
            system,
            keep_alive_interval: Duration::from_secs(settings.chat.keep_alive_minutes * 60),
            pair_timeout: Duration::from_secs(settings.chat.tool_pair_timeout_minutes * 60),
            tool_use_enabled: settings.chat.tool_use_enabled,
            use_thinking: settings.chat.use_thinking,
            use_cache: settings.chat.use_cache,
            cache_tools: settings.chat.cache_tools,
            cache_system: settings.chat.cache_system,
            cache_messages: settings.chat.cache_messages,
        }
    }
}

struct PendingToolCall {
    id: String,
    name: String,
    input: serde_json::Value,
}

/// Single owner of history, the tool-pair buffer, the permission gate, and
/// the keep-alive timer. Exactly one streaming request is in flight at any
/// time; concurrent senders queue behind the turn lock.
pub struct Orchestrator {
    provider: Arc<dyn ChatProvider>,
    tools: Vec<Arc<dyn Tool>>,
    config: OrchestratorConfig,
    history: StdMutex<Vec<Message>>,
    buffer: ToolPairBuffer,
    gate: PermissionGate,
    timer: KeepAliveTimer,
    store: Option<Arc<MessageStore>>,
    bus: BusSender,
    turn_lock: tokio::sync::Mutex<()>,
    cancel: StdMutex<CancellationToken>,
    timer_started: AtomicBool,
}

impl Orchestrator {
    /// Build the orchestrator and wire the keep-alive loop. Must run inside
    /// a Tokio runtime.
    pub fn spawn(
        provider: Arc<dyn ChatProvider>,
        tools: Vec<Arc<dyn Tool>>,
        gate: PermissionGate,
        config: OrchestratorConfig,
        store: Option<Arc<MessageStore>>,
        bus: BusSender,
    ) -> Arc<Self> {
        let (timer, timer_events) = KeepAliveTimer::spawn(config.keep_alive_interval, true);
        let orchestrator = Arc::new(Self {
            buffer: ToolPairBuffer::new(config.pair_timeout),
            provider,
            tools,
            gate,
            config,
            history: StdMutex::new(Vec::new()),
            timer,
            store,
            bus,
            turn_lock: tokio::sync::Mutex::new(()),
            cancel: StdMutex::new(CancellationToken::new()),
            timer_started: AtomicBool::new(false),
        });
        tokio::spawn(keep_alive_loop(
            Arc::downgrade(&orchestrator),
            timer_events,
        ));
        orchestrator
    }

    // ------------------------------------------------------------------
    // Public API
    // ------------------------------------------------------------------

    /// Main entry point: send one user message and stream the reply.
    pub async fn send_user(
        self: &Arc<Self>,
        text: &str,
        display: bool,
        persist: bool,
    ) -> Result<(), TetherError> {
        self.gate.reset_chain();
        self.send_text(text, display, persist).await
    }

    /// Silent cache-refresh ping; excluded from display and persistence.
    pub async fn send_keep_alive(self: &Arc<Self>) -> Result<(), TetherError> {
        self.send_text(KEEP_ALIVE_PROMPT, false, false).await
    }

    /// Cooperative cancellation of the in-flight stream. The next SSE read
    /// observes the token and exits; the partial turn is still committed.
    pub fn request_stop(&self) {
        let token = self.cancel.lock().unwrap().clone();
        token.cancel();
        let _ = self.bus.send(BusEvent::StopRequested);
    }

    /// Called by tool runners when handlers complete. Each result is packaged
    /// as a user `tool_result` message, buffered, and — once its `tool_use`
    /// half is present — sent back to the model through the normal path.
    pub async fn ingest_tool_results(
        self: &Arc<Self>,
        results: Vec<(String, Vec<String>, bool)>,
    ) -> Result<(), TetherError> {
        let _turn = self.turn_lock.lock().await;

        let mut ready: Vec<ToolPair> = Vec::new();
        for (id, lines, is_error) in results {
            let content: Vec<ContentBlock> =
                lines.into_iter().map(ContentBlock::text).collect();
            let message = Message::new(
                Role::User,
                vec![ContentBlock::tool_result(&id, content, is_error)],
            );
            if let Some(pair) = self.buffer.buffer_result(&id, message) {
                ready.push(pair);
            }
        }

        let outcome = self.buffer.flush();
        report_expired(&outcome.expired);
        ready.extend(outcome.pairs);

        self.drain_pairs(ready).await
    }

    /// Install a repaired snapshot of persisted history. Runs once at
    /// startup, before the first send. Returns the repaired message count.
    pub fn load_history(
        &self,
        persisted: Vec<Message>,
        truncate_chars: Option<usize>,
        max_count: usize,
        include_tools: bool,
    ) -> usize {
        let mut messages = persisted;
        if messages.len() > max_count {
            messages = messages.split_off(messages.len() - max_count);
        }
        if let Some(max) = truncate_chars {
            for msg in &mut messages {
                for block in &mut msg.content {
                    block.truncate_text(max);
                }
            }
        }
        if !include_tools {
            for msg in &mut messages {
                msg.content
                    .retain(|b| !b.is_tool_use() && !b.is_tool_result());
            }
            messages.retain(|m| !m.content.is_empty());
        }

        let repaired = tether_history::normalize(messages);
        let count = repaired.len();
        info!(count, "history loaded and normalized");
        *self.history.lock().unwrap() = repaired;
        count
    }

    pub fn history_snapshot(&self) -> Vec<Message> {
        self.history.lock().unwrap().clone()
    }

    pub fn pending_tool_names(&self) -> Vec<String> {
        self.buffer.pending_tool_names()
    }

    pub fn keep_alive_timer(&self) -> &KeepAliveTimer {
        &self.timer
    }

    /// Stop the keep-alive machinery. Safe to call more than once.
    pub fn shutdown(&self) {
        self.timer.dispose();
    }

    // ------------------------------------------------------------------
    // Turn pipeline
    // ------------------------------------------------------------------

    async fn send_text(
        self: &Arc<Self>,
        text: &str,
        display: bool,
        persist: bool,
    ) -> Result<(), TetherError> {
        let _turn = self.turn_lock.lock().await;

        // Expired entries are logged only; any straggler pairs that matched
        // while no sender was active are replayed before the new text.
        let outcome = self.buffer.flush();
        report_expired(&outcome.expired);
        self.drain_pairs(outcome.pairs).await?;

        let names = self.buffer.pending_tool_names();
        let body = if names.is_empty() {
            text.to_string()
        } else {
            format!("{}{}", pending_tool_notice(&names), text)
        };

        self.pump(Message::user_text(body), display, persist).await
    }

    /// Caller must hold the turn lock. The buffered tool-use message lands
    /// in history before its result goes out.
    async fn drain_pairs(
        self: &Arc<Self>,
        pairs: Vec<ToolPair>,
    ) -> Result<(), TetherError> {
        for pair in pairs {
            info!(tool_use_id = %pair.tool_use_id, "tool pair ready; sending result");
            self.commit_message(pair.tool_use, true);
            self.pump(pair.tool_result, true, true).await?;
        }
        Ok(())
    }

    /// Run turns until the queue drains: the initial message, then any
    /// pairs that became ready while committing.
    async fn pump(
        self: &Arc<Self>,
        first: Message,
        display: bool,
        persist: bool,
    ) -> Result<(), TetherError> {
        let mut queue: VecDeque<(Message, bool, bool)> = VecDeque::new();
        queue.push_back((first, display, persist));
        while let Some((message, display, persist)) = queue.pop_front() {
            let ready = self.run_turn(message, display, persist).await?;
            for pair in ready {
                self.commit_message(pair.tool_use, true);
                queue.push_back((pair.tool_result, true, true));
            }
        }
        Ok(())
    }

    /// One full request/stream/commit cycle for a single user message.
    async fn run_turn(
        self: &Arc<Self>,
        user_message: Message,
        display: bool,
        persist: bool,
    ) -> Result<Vec<ToolPair>, TetherError> {
        let keep_alive = user_message.is_keep_alive();
        self.commit_message(user_message, persist && !keep_alive);

        self.ensure_timer_running();
        self.reset_timer(); // request start

        let request = {
            let history = self.history.lock().unwrap();
            let tool_defs = if self.config.tool_use_enabled {
                to_definitions(&self.tools)
            } else {
                Vec::new()
            };
            builder::build_request(
                &history,
                &self.config.system,
                &tool_defs,
                &self.request_params(),
            )?
        };

        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = cancel.clone();

        let (tx, mut rx) = mpsc::channel::<SseEvent>(64);
        let provider = self.provider.clone();
        let stream_cancel = cancel.clone();
        let stream_task = tokio::spawn(async move {
            provider.send_stream(&request, tx, stream_cancel).await
        });

        let mut assembler = TurnAssembler::new(display.then(|| self.bus.clone()));
        let mut stream_error: Option<(String, String)> = None;
        while let Some(event) = rx.recv().await {
            if let SseEvent::Error { kind, detail } = &event {
                stream_error = Some((kind.clone(), detail.clone()));
                break;
            }
            assembler.apply(&event);
        }
        drop(rx);

        let mut turn_failed = false;
        match stream_task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                // Transport failures end the turn cleanly; the UI is told.
                let err: TetherError = err.into();
                warn!("stream request failed: {err}");
                turn_failed = true;
                let _ = self.bus.send(BusEvent::Error {
                    code: err.code().to_string(),
                    detail: err.to_string(),
                });
            }
            Err(join_err) => {
                warn!("stream task failed: {join_err}");
                turn_failed = true;
                let _ = self.bus.send(BusEvent::Error {
                    code: "INTERNAL_ERROR".to_string(),
                    detail: join_err.to_string(),
                });
            }
        }
        if let Some((kind, detail)) = stream_error {
            warn!(kind = %kind, "stream ended with error: {detail}");
            turn_failed = true;
            let code = if kind == "transport_error" {
                "TRANSPORT_ERROR"
            } else {
                "PROTOCOL_ERROR"
            };
            let _ = self.bus.send(BusEvent::Error {
                code: code.to_string(),
                detail: format!("{kind}: {detail}"),
            });
        }

        let cancelled = cancel.is_cancelled();
        let turn = assembler.finish(cancelled);
        if cancelled && display {
            let _ = self.bus.send(BusEvent::Cancelled);
        }

        self.reset_timer(); // response completion
        let (ready, calls) = self.commit_turn(turn, keep_alive, persist);

        for call in calls {
            self.dispatch_tool(call);
        }

        // Cancelled and Error are terminal for the turn on the bus.
        if display && !cancelled && !turn_failed {
            let _ = self.bus.send(BusEvent::InteractionComplete);
        }
        self.reset_timer(); // interaction complete
        Ok(ready)
    }

    /// Split and commit one completed assistant turn. Text (and thinking)
    /// content lands in history immediately so later context reflects what
    /// the user saw; each `tool_use` block is buffered under its id as its
    /// own assistant message.
    fn commit_turn(
        &self,
        turn: AssistantTurn,
        keep_alive: bool,
        persist: bool,
    ) -> (Vec<ToolPair>, Vec<PendingToolCall>) {
        if turn.blocks.is_empty() {
            return (Vec::new(), Vec::new());
        }
        let persist = persist && !keep_alive;

        if !turn.has_tool_use() {
            self.commit_message(Message::new(Role::Assistant, turn.blocks), persist);
            return (Vec::new(), Vec::new());
        }

        let mut text_blocks: Vec<ContentBlock> = turn
            .blocks
            .iter()
            .filter(|b| {
                matches!(
                    b,
                    ContentBlock::Text { .. }
                        | ContentBlock::Thinking { .. }
                        | ContentBlock::RedactedThinking { .. }
                )
            })
            .cloned()
            .collect();
        if text_blocks.is_empty() {
            // Role alternation still needs a committed assistant text turn.
            text_blocks.push(ContentBlock::text(TOOL_CALLED_TEXT));
        }
        self.commit_message(Message::new(Role::Assistant, text_blocks), persist);

        let mut ready = Vec::new();
        let mut calls = Vec::new();
        for block in turn.blocks.into_iter().filter(ContentBlock::is_tool_use) {
            let ContentBlock::ToolUse {
                ref id,
                ref name,
                ref input,
                ..
            } = block
            else {
                continue;
            };
            calls.push(PendingToolCall {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            });
            let tool_use_id = id.clone();
            let message = Message::new(Role::Assistant, vec![block]);
            debug!(tool_use_id = %tool_use_id, "buffering tool use");
            if let Some(pair) = self.buffer.buffer_use(&tool_use_id, message) {
                ready.push(pair);
            }
        }
        (ready, calls)
    }

    /// Gate, then run the handler concurrently with further conversation.
    /// Denied tools produce an immediate synthetic error result.
    fn dispatch_tool(self: &Arc<Self>, call: PendingToolCall) {
        let PendingToolCall { id, name, input } = call;

        if !self.gate.is_allowed(&name) {
            warn!(tool = %name, "tool denied by permission gate");
            let _ = self.bus.send(BusEvent::Warning {
                message: format!("tool '{name}' is not allowed in the current chain"),
            });
            let payload = permission_denied_payload(&name);
            let orchestrator = self.clone();
            tokio::spawn(async move {
                if let Err(e) = orchestrator
                    .ingest_tool_results(vec![(id, vec![payload], true)])
                    .await
                {
                    warn!("failed to ingest denied-tool result: {e}");
                }
            });
            return;
        }
        if self.gate.current_initiator().is_none() {
            self.gate.start_chain(Some(name.as_str()));
        }

        let handler = self.tools.iter().find(|t| t.name() == name).cloned();
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let output = match handler {
                Some(tool) => {
                    // A panicking handler becomes an is_error result; the
                    // model is expected to recover.
                    match tokio::spawn(async move { tool.execute(input).await }).await {
                        Ok(output) => output,
                        Err(join_err) => {
                            ToolOutput::error(format!("tool handler failed: {join_err}"))
                        }
                    }
                }
                None => ToolOutput::error(format!("unknown tool: {name}")),
            };
            if let Err(e) = orchestrator
                .ingest_tool_results(vec![(id, output.lines, output.is_error)])
                .await
            {
                warn!("failed to ingest tool result: {e}");
            }
        });
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn commit_message(&self, message: Message, persist: bool) {
        if persist {
            if let Some(store) = &self.store {
                if let Err(e) = store.append(message.role, &message.content) {
                    warn!("failed to persist message: {e}");
                }
            }
        }
        self.history.lock().unwrap().push(message);
    }

    fn request_params(&self) -> RequestParams {
        RequestParams {
            model: self.config.model.clone(),
            use_thinking: self.config.use_thinking,
            use_cache: self.config.use_cache,
            cache_tools: self.config.cache_tools,
            cache_system: self.config.cache_system,
            cache_messages: self.config.cache_messages,
            tool_choice: ToolChoice::Auto,
        }
    }

    fn ensure_timer_running(&self) {
        if !self.timer_started.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.timer.start() {
                warn!("keep-alive timer start failed: {e}");
            }
        }
    }

    fn reset_timer(&self) {
        if self.timer_started.load(Ordering::SeqCst) {
            if let Err(e) = self.timer.reset() {
                debug!("keep-alive timer reset skipped: {e}");
            }
        }
    }
}

fn report_expired(expired: &[ExpiredUse]) {
    for entry in expired {
        warn!(
            tool_use_id = %entry.tool_use_id,
            tools = ?entry.tool_names,
            "buffered tool use expired without a result; discarded"
        );
    }
}

/// Listens for timer completions and fires keep-alive pings. Holds only a
/// weak reference so a dropped orchestrator tears the loop down.
async fn keep_alive_loop(
    orchestrator: Weak<Orchestrator>,
    mut events: mpsc::UnboundedReceiver<TimerEvent>,
) {
    while let Some(event) = events.recv().await {
        if event == TimerEvent::Completed {
            let Some(orchestrator) = orchestrator.upgrade() else {
                break;
            };
            debug!("keep-alive interval elapsed; refreshing prompt cache");
            if let Err(e) = orchestrator.send_keep_alive().await {
                warn!("keep-alive ping failed: {e}");
            }
        }
    }
}
