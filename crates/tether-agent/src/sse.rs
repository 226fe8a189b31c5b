use std::collections::HashSet;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Token totals, merged across `message_start` and `message_delta`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Typed events decoded from the SSE stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    MessageStart {
        model: String,
        usage: Usage,
    },
    ContentBlockStart {
        index: usize,
        block: StartedBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: Delta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        stop_reason: Option<String>,
        usage: Option<Usage>,
    },
    MessageStop,
    Ping,
    /// Terminal for the stream; the caller surfaces it.
    Error {
        kind: String,
        detail: String,
    },
}

/// Opening metadata of a content block.
#[derive(Debug, Clone, PartialEq)]
pub enum StartedBlock {
    Text,
    Thinking,
    RedactedThinking { data: String },
    ToolUse { id: String, name: String },
}

/// One incremental fragment for an open content block.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Text(String),
    /// Partial JSON for a tool input object, concatenated by the assembler.
    InputJson(String),
    Thinking(String),
    Signature(String),
}

/// Outcome of feeding one line to the decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(SseEvent),
    /// `data: [DONE]` terminator.
    Done,
    /// Blank line, comment, or a frame kind we do not consume.
    Skip,
}

/// Stateful line decoder: parses `data:` frames and enforces that deltas
/// and stops only reference an index a `content_block_start` introduced.
#[derive(Default)]
pub struct SseDecoder {
    started: HashSet<usize>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, line: &str) -> Frame {
        let frame = parse_frame(line);
        let Frame::Event(ref event) = frame else {
            return frame;
        };
        match event {
            SseEvent::ContentBlockStart { index, .. } => {
                self.started.insert(*index);
                frame
            }
            SseEvent::ContentBlockDelta { index, .. }
            | SseEvent::ContentBlockStop { index } => {
                if !self.started.contains(index) {
                    return Frame::Event(SseEvent::Error {
                        kind: "protocol_error".to_string(),
                        detail: format!("content block index {index} referenced before start"),
                    });
                }
                frame
            }
            _ => frame,
        }
    }
}

/// Parse a single SSE line. Lines not prefixed `data:` are skipped.
pub fn parse_frame(line: &str) -> Frame {
    let line = line.trim();
    if line.is_empty() {
        return Frame::Skip;
    }
    let Some(data) = line.strip_prefix("data:") else {
        return Frame::Skip;
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return Frame::Done;
    }

    let wire: WireFrame = match serde_json::from_str(data) {
        Ok(w) => w,
        Err(e) => {
            return Frame::Event(SseEvent::Error {
                kind: "protocol_error".to_string(),
                detail: format!("unparseable frame: {e}"),
            })
        }
    };

    match wire.kind.as_str() {
        "message_start" => {
            let (model, usage) = wire
                .message
                .map(|m| {
                    (
                        m.model,
                        Usage {
                            input_tokens: m.usage.map(|u| u.input_tokens.unwrap_or(0)).unwrap_or(0),
                            output_tokens: 0,
                        },
                    )
                })
                .unwrap_or_default();
            Frame::Event(SseEvent::MessageStart { model, usage })
        }
        "content_block_start" => {
            let Some(index) = wire.index else {
                return protocol_error("content_block_start without index");
            };
            let Some(block) = wire.content_block else {
                return protocol_error("content_block_start without content_block");
            };
            let started = match block.kind.as_str() {
                "text" => StartedBlock::Text,
                "thinking" => StartedBlock::Thinking,
                "redacted_thinking" => StartedBlock::RedactedThinking {
                    data: block.data.unwrap_or_default(),
                },
                "tool_use" => StartedBlock::ToolUse {
                    id: block.id.unwrap_or_default(),
                    name: block.name.unwrap_or_default(),
                },
                other => {
                    debug!(kind = other, "unhandled content block kind");
                    return Frame::Skip;
                }
            };
            Frame::Event(SseEvent::ContentBlockStart {
                index,
                block: started,
            })
        }
        "content_block_delta" => {
            let Some(index) = wire.index else {
                return protocol_error("content_block_delta without index");
            };
            let Some(delta) = wire.delta else {
                return protocol_error("content_block_delta without delta");
            };
            let parsed = match delta.kind.as_str() {
                "text_delta" => Delta::Text(delta.text.unwrap_or_default()),
                "input_json_delta" => Delta::InputJson(delta.partial_json.unwrap_or_default()),
                "thinking_delta" => Delta::Thinking(delta.thinking.unwrap_or_default()),
                "signature_delta" => Delta::Signature(delta.signature.unwrap_or_default()),
                other => {
                    debug!(delta_type = other, "unhandled delta type");
                    return Frame::Skip;
                }
            };
            Frame::Event(SseEvent::ContentBlockDelta {
                index,
                delta: parsed,
            })
        }
        "content_block_stop" => match wire.index {
            Some(index) => Frame::Event(SseEvent::ContentBlockStop { index }),
            None => protocol_error("content_block_stop without index"),
        },
        "message_delta" => Frame::Event(SseEvent::MessageDelta {
            stop_reason: wire.delta.and_then(|d| d.stop_reason),
            usage: wire.usage.map(|u| Usage {
                input_tokens: u.input_tokens.unwrap_or(0),
                output_tokens: u.output_tokens.unwrap_or(0),
            }),
        }),
        "message_stop" => Frame::Event(SseEvent::MessageStop),
        "ping" => Frame::Event(SseEvent::Ping),
        "error" => {
            let (kind, detail) = wire
                .error
                .map(|e| (e.kind, e.message))
                .unwrap_or_else(|| ("error".to_string(), String::new()));
            Frame::Event(SseEvent::Error { kind, detail })
        }
        other => {
            debug!(event_type = other, "skipping unknown frame kind");
            Frame::Skip
        }
    }
}

fn protocol_error(detail: &str) -> Frame {
    Frame::Event(SseEvent::Error {
        kind: "protocol_error".to_string(),
        detail: detail.to_string(),
    })
}

/// Read the HTTP response body as an SSE stream, decode frames, and forward
/// events. Returns when the stream ends, a terminal error is emitted, or the
/// cancellation token fires (checked on every read).
pub async fn decode_stream(
    resp: reqwest::Response,
    tx: mpsc::Sender<SseEvent>,
    cancel: CancellationToken,
) {
    use futures_util::StreamExt;

    let mut decoder = SseDecoder::new();
    let mut line_buf = String::new();
    let mut byte_stream = resp.bytes_stream();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("stream cancelled by caller");
                return;
            }
            chunk = byte_stream.next() => chunk,
        };
        let chunk = match chunk {
            None => break,
            Some(Ok(c)) => c,
            Some(Err(e)) => {
                let _ = tx
                    .send(SseEvent::Error {
                        kind: "transport_error".to_string(),
                        detail: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        // Multiple lines per chunk; keep the incomplete last line buffered.
        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            match decoder.accept(line) {
                Frame::Skip => {}
                Frame::Done => return,
                Frame::Event(event) => {
                    let terminal = matches!(event, SseEvent::Error { .. });
                    if terminal {
                        warn!(?event, "terminal stream event");
                    }
                    if tx.send(event).await.is_err() {
                        return; // receiver dropped
                    }
                    if terminal {
                        return;
                    }
                }
            }
        }

        line_buf = remainder;
    }
}

// SSE wire shapes (private — deserialization only).

#[derive(Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: String,
    index: Option<usize>,
    message: Option<WireMessage>,
    content_block: Option<WireBlock>,
    delta: Option<WireDelta>,
    usage: Option<WireUsage>,
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    model: String,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireBlock {
    #[serde(rename = "type")]
    kind: String,
    id: Option<String>,
    name: Option<String>,
    data: Option<String>,
}

#[derive(Deserialize)]
struct WireDelta {
    #[serde(rename = "type", default)]
    kind: String,
    text: Option<String>,
    partial_json: Option<String>,
    thinking: Option<String>,
    signature: Option<String>,
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct WireError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_data_lines_are_skipped() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.accept(""), Frame::Skip);
        assert_eq!(decoder.accept("event: message_start"), Frame::Skip);
        assert_eq!(decoder.accept(": comment"), Frame::Skip);
    }

    #[test]
    fn done_terminator_recognized() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.accept("data: [DONE]"), Frame::Done);
    }

    #[test]
    fn ping_frames_pass_through() {
        let mut decoder = SseDecoder::new();
        assert_eq!(
            decoder.accept(r#"data: {"type":"ping"}"#),
            Frame::Event(SseEvent::Ping)
        );
    }

    #[test]
    fn message_start_extracts_model_and_usage() {
        let mut decoder = SseDecoder::new();
        let frame = decoder.accept(
            r#"data: {"type":"message_start","message":{"model":"claude-sonnet-4-6","usage":{"input_tokens":12}}}"#,
        );
        assert_eq!(
            frame,
            Frame::Event(SseEvent::MessageStart {
                model: "claude-sonnet-4-6".to_string(),
                usage: Usage {
                    input_tokens: 12,
                    output_tokens: 0
                },
            })
        );
    }

    #[test]
    fn text_block_lifecycle_decodes_in_order() {
        let mut decoder = SseDecoder::new();
        assert_eq!(
            decoder.accept(r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#),
            Frame::Event(SseEvent::ContentBlockStart {
                index: 0,
                block: StartedBlock::Text
            })
        );
        assert_eq!(
            decoder.accept(r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hello"}}"#),
            Frame::Event(SseEvent::ContentBlockDelta {
                index: 0,
                delta: Delta::Text("hello".to_string())
            })
        );
        assert_eq!(
            decoder.accept(r#"data: {"type":"content_block_stop","index":0}"#),
            Frame::Event(SseEvent::ContentBlockStop { index: 0 })
        );
    }

    #[test]
    fn tool_use_start_captures_id_and_name() {
        let mut decoder = SseDecoder::new();
        let frame = decoder.accept(
            r#"data: {"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"t1","name":"demo","input":{}}}"#,
        );
        assert_eq!(
            frame,
            Frame::Event(SseEvent::ContentBlockStart {
                index: 1,
                block: StartedBlock::ToolUse {
                    id: "t1".to_string(),
                    name: "demo".to_string()
                },
            })
        );
    }

    #[test]
    fn delta_before_start_is_protocol_error() {
        let mut decoder = SseDecoder::new();
        let frame = decoder.accept(
            r#"data: {"type":"content_block_delta","index":3,"delta":{"type":"text_delta","text":"x"}}"#,
        );
        let Frame::Event(SseEvent::Error { kind, .. }) = frame else {
            panic!("expected protocol error, got {frame:?}");
        };
        assert_eq!(kind, "protocol_error");
    }

    #[test]
    fn malformed_json_is_protocol_error() {
        let mut decoder = SseDecoder::new();
        let frame = decoder.accept("data: {not json");
        let Frame::Event(SseEvent::Error { kind, .. }) = frame else {
            panic!("expected protocol error, got {frame:?}");
        };
        assert_eq!(kind, "protocol_error");
    }

    #[test]
    fn message_delta_carries_stop_reason_and_usage() {
        let mut decoder = SseDecoder::new();
        let frame = decoder.accept(
            r#"data: {"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":42}}"#,
        );
        assert_eq!(
            frame,
            Frame::Event(SseEvent::MessageDelta {
                stop_reason: Some("tool_use".to_string()),
                usage: Some(Usage {
                    input_tokens: 0,
                    output_tokens: 42
                }),
            })
        );
    }

    #[test]
    fn server_error_frame_is_terminal_event() {
        let mut decoder = SseDecoder::new();
        let frame = decoder.accept(
            r#"data: {"type":"error","error":{"type":"overloaded_error","message":"busy"}}"#,
        );
        assert_eq!(
            frame,
            Frame::Event(SseEvent::Error {
                kind: "overloaded_error".to_string(),
                detail: "busy".to_string()
            })
        );
    }

    #[test]
    fn unknown_frame_kinds_are_skipped() {
        let mut decoder = SseDecoder::new();
        assert_eq!(
            decoder.accept(r#"data: {"type":"content_block_glitter","index":0}"#),
            Frame::Skip
        );
    }
}
