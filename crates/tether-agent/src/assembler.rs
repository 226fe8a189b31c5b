use std::collections::BTreeMap;

use tracing::warn;

use tether_core::{ContentBlock, GENERATION_STOPPED_MARKER};

use crate::events::{BusEvent, BusSender};
use crate::sse::{Delta, SseEvent, StartedBlock, Usage};

/// Why the model stopped producing output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    CancelledByUser,
    Other(String),
}

impl StopReason {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "end_turn" => StopReason::EndTurn,
            "tool_use" => StopReason::ToolUse,
            "max_tokens" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            other => StopReason::Other(other.to_string()),
        }
    }
}

/// One completed assistant turn.
#[derive(Debug, Clone)]
pub struct AssistantTurn {
    /// Finalized blocks in ascending index order.
    pub blocks: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
    pub model: String,
}

impl AssistantTurn {
    pub fn has_tool_use(&self) -> bool {
        self.blocks.iter().any(ContentBlock::is_tool_use)
    }
}

enum Accumulator {
    Text { buf: String, first_fragment: bool },
    Thinking { buf: String, signature: String },
    RedactedThinking { data: String },
    ToolUse { id: String, name: String, json: String },
}

/// Collapses decoded SSE events into one assistant turn, republishing
/// deltas to the UI bus as they arrive.
pub struct TurnAssembler {
    open: BTreeMap<usize, Accumulator>,
    finalized: BTreeMap<usize, ContentBlock>,
    stop_reason: Option<StopReason>,
    usage: Usage,
    model: String,
    bus: Option<BusSender>,
}

impl TurnAssembler {
    /// `bus` is `None` for silent turns (keep-alive pings).
    pub fn new(bus: Option<BusSender>) -> Self {
        Self {
            open: BTreeMap::new(),
            finalized: BTreeMap::new(),
            stop_reason: None,
            usage: Usage::default(),
            model: String::new(),
            bus,
        }
    }

    fn publish(&self, event: BusEvent) {
        if let Some(bus) = &self.bus {
            let _ = bus.send(event);
        }
    }

    /// Feed one decoded event.
    pub fn apply(&mut self, event: &SseEvent) {
        match event {
            SseEvent::MessageStart { model, usage } => {
                self.model = model.clone();
                self.usage.input_tokens = usage.input_tokens;
                self.publish(BusEvent::MessageStart);
            }
            SseEvent::ContentBlockStart { index, block } => {
                let (acc, kind) = match block {
                    StartedBlock::Text => (
                        Accumulator::Text {
                            buf: String::new(),
                            first_fragment: true,
                        },
                        "text",
                    ),
                    StartedBlock::Thinking => (
                        Accumulator::Thinking {
                            buf: String::new(),
                            signature: String::new(),
                        },
                        "thinking",
                    ),
                    StartedBlock::RedactedThinking { data } => (
                        Accumulator::RedactedThinking { data: data.clone() },
                        "redacted_thinking",
                    ),
                    StartedBlock::ToolUse { id, name } => (
                        Accumulator::ToolUse {
                            id: id.clone(),
                            name: name.clone(),
                            json: String::new(),
                        },
                        "tool_use",
                    ),
                };
                self.open.insert(*index, acc);
                self.publish(BusEvent::ContentBlockStart {
                    index: *index,
                    kind: kind.to_string(),
                });
            }
            SseEvent::ContentBlockDelta { index, delta } => {
                let fragment = self.append_delta(*index, delta);
                if let Some(fragment) = fragment {
                    self.publish(BusEvent::ContentBlockDelta {
                        index: *index,
                        fragment,
                    });
                }
            }
            SseEvent::ContentBlockStop { index } => {
                if let Some(acc) = self.open.remove(index) {
                    let block = self.finalize_block(acc);
                    self.finalized.insert(*index, block);
                }
                self.publish(BusEvent::ContentBlockStop { index: *index });
            }
            SseEvent::MessageDelta { stop_reason, usage } => {
                if let Some(reason) = stop_reason {
                    self.stop_reason = Some(StopReason::from_wire(reason));
                }
                if let Some(usage) = usage {
                    if usage.output_tokens > 0 {
                        self.usage.output_tokens = usage.output_tokens;
                    }
                    if usage.input_tokens > 0 {
                        self.usage.input_tokens = usage.input_tokens;
                    }
                    self.publish(BusEvent::Usage(self.usage));
                }
                self.publish(BusEvent::MessageDelta {
                    stop_reason: stop_reason.clone(),
                });
            }
            SseEvent::MessageStop => {
                self.publish(BusEvent::MessageStop);
            }
            SseEvent::Ping => {
                self.publish(BusEvent::Ping);
            }
            SseEvent::Error { .. } => {
                // Terminal; the orchestrator republishes with an error code.
            }
        }
    }

    /// Returns the fragment to republish, if any.
    fn append_delta(&mut self, index: usize, delta: &Delta) -> Option<String> {
        let acc = self.open.get_mut(&index)?;
        match (acc, delta) {
            (
                Accumulator::Text {
                    buf,
                    first_fragment,
                },
                Delta::Text(text),
            ) => {
                // The model often opens a block with a cosmetic newline.
                let text = if *first_fragment {
                    text.strip_prefix('\n').unwrap_or(text.as_str())
                } else {
                    text.as_str()
                };
                *first_fragment = false;
                buf.push_str(text);
                Some(text.to_string())
            }
            (Accumulator::Thinking { buf, .. }, Delta::Thinking(text)) => {
                buf.push_str(text);
                Some(text.clone())
            }
            (Accumulator::Thinking { signature, .. }, Delta::Signature(sig)) => {
                signature.push_str(sig);
                None
            }
            (Accumulator::ToolUse { json, .. }, Delta::InputJson(fragment)) => {
                json.push_str(fragment);
                Some(fragment.clone())
            }
            (_, delta) => {
                warn!(index, ?delta, "delta type does not match open block");
                None
            }
        }
    }

    fn finalize_block(&self, acc: Accumulator) -> ContentBlock {
        match acc {
            Accumulator::Text { buf, .. } => ContentBlock::text(buf),
            Accumulator::Thinking { buf, signature } => ContentBlock::Thinking {
                thinking: buf,
                signature,
            },
            Accumulator::RedactedThinking { data } => ContentBlock::RedactedThinking { data },
            Accumulator::ToolUse { id, name, json } => {
                let input = if json.trim().is_empty() {
                    serde_json::Value::Object(Default::default())
                } else {
                    match serde_json::from_str(&json) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(tool = %name, "tool input JSON did not parse: {e}");
                            self.publish(BusEvent::Error {
                                code: "PROTOCOL_ERROR".to_string(),
                                detail: format!("tool input for '{name}' did not parse: {e}"),
                            });
                            serde_json::Value::Object(Default::default())
                        }
                    }
                };
                ContentBlock::tool_use(id, name, input)
            }
        }
    }

    /// Emit the completed turn. Call after `message_stop`, stream close, or
    /// cancellation; any still-open accumulators are finalized as-is.
    pub fn finish(mut self, cancelled: bool) -> AssistantTurn {
        let open = std::mem::take(&mut self.open);
        for (index, acc) in open {
            let block = self.finalize_block(acc);
            self.finalized.insert(index, block);
        }

        let mut blocks: Vec<ContentBlock> = std::mem::take(&mut self.finalized)
            .into_values()
            .collect();

        let stop_reason = if cancelled {
            if let Some(ContentBlock::Text { text, .. }) =
                blocks.iter_mut().rev().find(|b| b.is_text())
            {
                text.push_str(GENERATION_STOPPED_MARKER);
            } else if !blocks.is_empty() {
                blocks.push(ContentBlock::text(GENERATION_STOPPED_MARKER));
            }
            StopReason::CancelledByUser
        } else {
            self.stop_reason.take().unwrap_or(StopReason::EndTurn)
        };

        AssistantTurn {
            blocks,
            stop_reason,
            usage: self.usage,
            model: std::mem::take(&mut self.model),
        }
    }
}
